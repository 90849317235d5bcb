use std::{fs, path::Path};

use crate::{field::FieldError, msr::Addr, CpuId};

/// Read access to the raw registers and kernel scalars of the machine.
///
/// Each call is independent: implementations must not cache values between calls,
/// and one failing read must not affect the others.
pub trait RegisterSource: Send + Sync {
    /// Reads the 64-bit register at `address` on the given cpu.
    fn read_counter(&self, cpu: CpuId, address: Addr) -> Result<u64, FieldError>;

    /// Reads a textual scalar (sysfs or procfs file), with trailing whitespace removed.
    fn read_scalar(&self, path: &Path) -> Result<String, FieldError>;

    /// Reads a scalar and parses it as an integer.
    fn read_int(&self, path: &Path) -> Result<i64, FieldError> {
        let content = self.read_scalar(path)?;
        content.parse().map_err(|_| FieldError::Parse(content))
    }

    /// Reads a scalar and parses it as an unsigned counter.
    fn read_u64(&self, path: &Path) -> Result<u64, FieldError> {
        let content = self.read_scalar(path)?;
        content.parse().map_err(|_| FieldError::Parse(content))
    }
}

/// Reads a sysfs file and trims its trailing newline.
pub fn read_sysfs(path: &Path) -> Result<String, FieldError> {
    let content = fs::read_to_string(path)?;
    Ok(content.trim_end().to_owned())
}
