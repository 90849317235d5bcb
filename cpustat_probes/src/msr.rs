// According to Intel 64 and IA-32 architectures software developer's manual, volume 4,
// the registers below are architectural (IA32_*) and available on every recent Intel cpu.
// Reading them requires the `msr` kernel module and CAP_SYS_RAWIO (usually root).

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    os::unix::prelude::FileExt,
    path::Path,
};

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use regex::Regex;

use crate::{
    field::FieldError,
    source::{read_sysfs, RegisterSource},
    CpuId,
};

pub type Addr = u64;

/// MSR registers' addresses
pub mod intel {
    use super::Addr;

    pub const MSR_IA32_TSC: Addr = 0x10;
    pub const MSR_IA32_MPERF: Addr = 0xE7;
    pub const MSR_IA32_APERF: Addr = 0xE8;
    pub const MSR_IA32_THERM_STATUS: Addr = 0x19C;
    pub const MSR_IA32_PACKAGE_THERM_STATUS: Addr = 0x1B1;
    pub const MSR_IA32_TEMPERATURE_TARGET: Addr = 0x1A2;

    /// Fixed-function counter 0: instructions retired
    pub const MSR_IA32_FIXED_CTR0: Addr = 0x309;
    /// Fixed-function counter 1: unhalted core cycles
    pub const MSR_IA32_FIXED_CTR1: Addr = 0x30A;
    pub const MSR_IA32_FIXED_CTR_CTRL: Addr = 0x38D;
    pub const MSR_IA32_PERF_GLOBAL_CTRL: Addr = 0x38F;
}

/// TjMax to use when IA32_TEMPERATURE_TARGET cannot be read.
pub const DEFAULT_TJMAX: u32 = 100;

/// Bits 3:0 of IA32_FIXED_CTR_CTRL configure CTR0, bits 7:4 configure CTR1.
const FIXED_CTR_CONFIG_MASK: u64 = 0xFF;
/// Count in ring 0 and ring 3, for both CTR0 and CTR1.
const FIXED_CTR_CONFIG_VAL: u64 = 0x33;
/// Bits 32 and 33 of IA32_PERF_GLOBAL_CTRL enable CTR0 and CTR1.
const FIXED_CTR_ENABLE_BITS: u64 = 0b11 << 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

/// Reads the MSRs via `/dev/cpu/<cpu_id>/msr`, and sysfs scalars via the filesystem.
///
/// The device files are opened once, at creation. A cpu whose device cannot be opened
/// still exists: all its register reads fail with the error of the `open`.
pub struct MsrRegisters {
    devices: BTreeMap<CpuId, Result<File, FieldError>>,
}

impl MsrRegisters {
    /// Opens the MSR device of each cpu. With `writable`, the devices are opened in read-write mode,
    /// which is required by [`enable_fixed_counters`].
    pub fn open(cpus: &BTreeSet<CpuId>, writable: bool) -> MsrRegisters {
        Self::open_at(Path::new("/dev/cpu"), cpus, writable)
    }

    pub fn open_at(dev_cpu: &Path, cpus: &BTreeSet<CpuId>, writable: bool) -> MsrRegisters {
        let devices = cpus
            .iter()
            .map(|&cpu| {
                let path = dev_cpu.join(format!("{cpu}/msr"));
                let opened = OpenOptions::new().read(true).write(writable).open(&path);
                if let Err(e) = &opened {
                    debug!("cannot open {}: {e}", path.display());
                }
                (cpu, opened.map_err(FieldError::from))
            })
            .collect();
        MsrRegisters { devices }
    }

    /// Returns `true` if at least one MSR device could be opened.
    pub fn any_accessible(&self) -> bool {
        self.devices.values().any(|d| d.is_ok())
    }

    fn device(&self, cpu: CpuId) -> Result<&File, FieldError> {
        match self.devices.get(&cpu) {
            Some(Ok(fd)) => Ok(fd),
            Some(Err(e)) => Err(e.clone()),
            None => Err(FieldError::NotFound),
        }
    }

    pub fn write_counter(&self, cpu: CpuId, address: Addr, value: u64) -> Result<(), FieldError> {
        write_msr(self.device(cpu)?, address, value)
    }
}

impl RegisterSource for MsrRegisters {
    fn read_counter(&self, cpu: CpuId, address: Addr) -> Result<u64, FieldError> {
        read_msr(self.device(cpu)?, address)
    }

    fn read_scalar(&self, path: &Path) -> Result<String, FieldError> {
        read_sysfs(path)
    }
}

fn read_msr(msr: &File, at: Addr) -> Result<u64, FieldError> {
    let mut buf = [0u8; 8];
    let n = msr.read_at(&mut buf, at)?;
    if n != buf.len() {
        return Err(FieldError::ShortRead(n));
    }
    Ok(u64::from_le_bytes(buf))
}

fn write_msr(msr: &File, at: Addr, value: u64) -> Result<(), FieldError> {
    let n = msr.write_at(&value.to_le_bytes(), at)?;
    if n != 8 {
        return Err(FieldError::ShortRead(n));
    }
    Ok(())
}

/// Extracts TjMax (the throttling temperature, in °C) from IA32_TEMPERATURE_TARGET, bits 23:16.
pub fn read_tjmax(source: &dyn RegisterSource, cpu: CpuId) -> u32 {
    match source.read_counter(cpu, intel::MSR_IA32_TEMPERATURE_TARGET) {
        Ok(value) => match ((value >> 16) & 0xFF) as u32 {
            0 => DEFAULT_TJMAX,
            tcc => tcc,
        },
        Err(e) => {
            debug!("cannot read TjMax on cpu {cpu}: {e}, using {DEFAULT_TJMAX}°C");
            DEFAULT_TJMAX
        }
    }
}

/// The thermal status registers report a distance to TjMax (bits 22:16), not an absolute temperature.
pub fn decode_temperature(therm_status: u64, tjmax: u32) -> i32 {
    tjmax as i32 - ((therm_status >> 16) & 0x7F) as i32
}

/// Bit 0 is the current throttling status, bit 1 the sticky log of a past throttling.
pub fn decode_throttled(therm_status: u64) -> bool {
    therm_status & 0b11 != 0
}

fn fixed_ctr_ctrl_enabled(current: u64) -> u64 {
    (current & !FIXED_CTR_CONFIG_MASK) | FIXED_CTR_CONFIG_VAL
}

fn global_ctrl_enabled(current: u64) -> u64 {
    current | FIXED_CTR_ENABLE_BITS
}

fn global_ctrl_disabled(current: u64) -> u64 {
    current & !FIXED_CTR_ENABLE_BITS
}

/// Configures and enables the fixed-function counters 0 (instructions) and 1 (core cycles)
/// on each cpu, with read-modify-write to keep the other bits untouched.
///
/// Returns the cpus on which the counters have been enabled.
pub fn enable_fixed_counters(msr: &MsrRegisters, cpus: &BTreeSet<CpuId>) -> Vec<CpuId> {
    let mut enabled = Vec::with_capacity(cpus.len());
    for &cpu in cpus {
        let res = (|| {
            let ctrl = msr.read_counter(cpu, intel::MSR_IA32_FIXED_CTR_CTRL)?;
            msr.write_counter(cpu, intel::MSR_IA32_FIXED_CTR_CTRL, fixed_ctr_ctrl_enabled(ctrl))?;
            let global = msr.read_counter(cpu, intel::MSR_IA32_PERF_GLOBAL_CTRL)?;
            msr.write_counter(cpu, intel::MSR_IA32_PERF_GLOBAL_CTRL, global_ctrl_enabled(global))
        })();
        match res {
            Ok(()) => enabled.push(cpu),
            Err(e) => warn!("cpu {cpu}: failed to enable the fixed counters: {e}"),
        }
    }
    if enabled.len() == cpus.len() {
        info!("Fixed counters enabled on all {} cpus.", cpus.len());
    } else {
        warn!(
            "Fixed counters enabled on {}/{} cpus, IPC will be zero on the others.",
            enabled.len(),
            cpus.len()
        );
    }
    enabled
}

/// Clears the global enable bits of the fixed counters, only where they are set.
pub fn disable_fixed_counters(msr: &MsrRegisters, cpus: &[CpuId]) {
    for &cpu in cpus {
        let res = msr
            .read_counter(cpu, intel::MSR_IA32_PERF_GLOBAL_CTRL)
            .and_then(|global| {
                let cleared = global_ctrl_disabled(global);
                if cleared != global {
                    msr.write_counter(cpu, intel::MSR_IA32_PERF_GLOBAL_CTRL, cleared)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = res {
            warn!("cpu {cpu}: failed to disable the fixed counters: {e}");
        }
    }
}

pub fn cpu_vendor(cpuinfo: &Path) -> anyhow::Result<CpuVendor> {
    let content = fs::read_to_string(cpuinfo).with_context(|| format!("failed to read {}", cpuinfo.display()))?;
    parse_cpu_vendor(&content)
}

fn parse_cpu_vendor(cpuinfo: &str) -> anyhow::Result<CpuVendor> {
    // find the first vendor_id line
    let vendor_regex = Regex::new(r"(?m)^vendor_id\s*:\s*(\w+)")?;
    let vendor = vendor_regex
        .captures(cpuinfo)
        .and_then(|c| c.get(1))
        .context("vendor id not found in cpuinfo")?
        .as_str();

    match vendor {
        "AuthenticAMD" => Ok(CpuVendor::Amd),
        "GenuineIntel" => Ok(CpuVendor::Intel),
        _ => Err(anyhow!("Unsupported CPU vendor {vendor}")),
    }
}
