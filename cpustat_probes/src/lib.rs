//! Per-CPU hardware counter sampling.
//!
//! The crate reads raw, monotonically increasing counters (TSC, APERF/MPERF, fixed-function
//! counters, RAPL energy, cpuidle residency) and kernel scalars (frequency, governor, temperature),
//! then turns two successive snapshots into interval deltas and human-meaningful rates.
//!
//! ## Usage
//!
//! ```no_run
//! use std::collections::BTreeSet;
//! use cpustat_probes::{msr::MsrRegisters, sampler::Sampler, snapshot::SnapshotBuilder, topology::Topology, SysPaths};
//!
//! let paths = SysPaths::default();
//! let cpus: BTreeSet<u32> = cpustat_probes::topology::effective_cpus(&paths)?.into_iter().collect();
//! let topology = Topology::from_sysfs(&paths, &cpus)?;
//! let registers = MsrRegisters::open(&cpus, false);
//! let builder = SnapshotBuilder::new(registers, topology, paths);
//! let mut sampler = Sampler::new(builder, cpus, Default::default())?;
//!
//! sampler.sample(); // the first pass only primes the previous snapshot set
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! if let Some(report) = sampler.sample() {
//!     for cpu in &report.cpus {
//!         println!("cpu {}: {:.2}% busy", cpu.cpu_id, cpu.metrics.busy_percent);
//!     }
//! }
//! # anyhow::Ok(())
//! ```

use std::path::{Path, PathBuf};

use enum_map::Enum;

pub mod cpuidle;
pub mod delta;
pub mod field;
pub mod interrupts;
pub mod metrics;
pub mod msr;
pub mod powercap;
pub mod sampler;
pub mod snapshot;
pub mod source;
pub mod topology;

/// Logical CPU number, as used by the kernel (`cpuN`).
pub type CpuId = u32;
/// Physical core id, unique within a package.
pub type CoreId = u32;
/// Physical package (socket) id.
pub type PackageId = u32;

/// RAPL domains whose energy accumulators are sampled per package.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RaplDomain {
    /// entire socket
    Package,
    /// DRAM attached to the socket
    Dram,
}

impl RaplDomain {
    pub const ALL: [RaplDomain; 2] = [RaplDomain::Package, RaplDomain::Dram];
}

impl std::fmt::Display for RaplDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RaplDomain::Package => "package",
            RaplDomain::Dram => "dram",
        })
    }
}

/// Roots of the kernel pseudo-filesystems.
///
/// Every path the crate reads is derived from these, so that tests can point them to a fake tree.
#[derive(Debug, Clone)]
pub struct SysPaths {
    /// Usually `/sys`.
    pub sys: PathBuf,
    /// Usually `/proc`.
    pub proc: PathBuf,
}

impl Default for SysPaths {
    fn default() -> Self {
        SysPaths {
            sys: PathBuf::from("/sys"),
            proc: PathBuf::from("/proc"),
        }
    }
}

impl SysPaths {
    pub fn with_root(root: &Path) -> SysPaths {
        SysPaths {
            sys: root.join("sys"),
            proc: root.join("proc"),
        }
    }

    /// `/sys/devices/system/cpu/cpu<N>`
    pub fn cpu_dir(&self, cpu: CpuId) -> PathBuf {
        self.sys.join(format!("devices/system/cpu/cpu{cpu}"))
    }

    /// `/sys/devices/system/cpu/cpu<N>/cpufreq/<file>`
    pub fn cpufreq(&self, cpu: CpuId, file: &str) -> PathBuf {
        self.cpu_dir(cpu).join("cpufreq").join(file)
    }

    pub fn energy_perf_bias(&self, cpu: CpuId) -> PathBuf {
        self.cpu_dir(cpu).join("power/energy_perf_bias")
    }

    pub fn online_cpus(&self) -> PathBuf {
        self.sys.join("devices/system/cpu/online")
    }

    pub fn intel_pstate(&self) -> PathBuf {
        self.sys.join("devices/system/cpu/intel_pstate")
    }

    pub fn powercap(&self) -> PathBuf {
        self.sys.join("class/powercap")
    }

    pub fn interrupts(&self) -> PathBuf {
        self.proc.join("interrupts")
    }

    pub fn cpuinfo(&self) -> PathBuf {
        self.proc.join("cpuinfo")
    }
}
