// See https://www.kernel.org/doc/html/latest/admin-guide/pm/cpuidle.html
// for the layout of /sys/devices/system/cpu/cpu<N>/cpuidle.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use log::debug;

use crate::{source::read_sysfs, CpuId, SysPaths};

/// The kernel exposes at most this many idle states per cpu.
pub const MAX_CPUIDLE_STATES: usize = 10;

/// An idle state of one cpu, e.g. `C1E`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleState {
    /// Index of the state directory (`state<index>`)
    pub index: usize,
    /// The name of the state, as reported by the kernel (`POLL`, `C1`, `C6`...)
    pub name: String,
    /// Path of the file that holds the cumulative residency, in microseconds.
    pub time_path: PathBuf,
}

/// Idle states of each monitored cpu, discovered once at start-up.
#[derive(Debug, Clone, Default)]
pub struct IdleStateTable {
    per_cpu: BTreeMap<CpuId, Vec<IdleState>>,
}

impl IdleStateTable {
    pub fn discover(paths: &SysPaths, cpus: &BTreeSet<CpuId>) -> IdleStateTable {
        let per_cpu = cpus
            .iter()
            .map(|&cpu| (cpu, discover_cpu(paths, cpu)))
            .collect();
        IdleStateTable { per_cpu }
    }

    pub fn from_states(per_cpu: impl IntoIterator<Item = (CpuId, Vec<IdleState>)>) -> IdleStateTable {
        IdleStateTable {
            per_cpu: per_cpu.into_iter().collect(),
        }
    }

    pub fn states_of(&self, cpu: CpuId) -> &[IdleState] {
        self.per_cpu.get(&cpu).map(Vec::as_slice).unwrap_or_default()
    }

    /// All the state names, ordered by state index, without duplicates.
    pub fn state_names(&self) -> Vec<String> {
        let mut indexed: Vec<(usize, &str)> = self
            .per_cpu
            .values()
            .flatten()
            .map(|s| (s.index, s.name.as_str()))
            .collect();
        indexed.sort();
        let mut names: Vec<String> = Vec::with_capacity(indexed.len());
        for (_, name) in indexed {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_owned());
            }
        }
        names
    }
}

fn discover_cpu(paths: &SysPaths, cpu: CpuId) -> Vec<IdleState> {
    let base = paths.cpu_dir(cpu).join("cpuidle");
    let mut states = Vec::new();
    for index in 0..MAX_CPUIDLE_STATES {
        let dir = base.join(format!("state{index}"));
        let time_path = dir.join("time");
        if !dir.is_dir() || !time_path.exists() {
            continue;
        }
        match read_sysfs(&dir.join("name")) {
            Ok(name) if !name.is_empty() => states.push(IdleState { index, name, time_path }),
            Ok(_) => (),
            Err(e) => debug!("cpu {cpu}: unnamed idle state {index}: {e}"),
        }
    }
    states
}
