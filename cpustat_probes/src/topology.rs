use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    num::ParseIntError,
};

use anyhow::{anyhow, Context};
use log::{debug, warn};

use crate::{source::read_sysfs, CoreId, CpuId, PackageId, SysPaths};

/// Where a logical cpu sits in the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    /// `None` if the core id could not be read: such a cpu is never merged with another one.
    pub core: Option<CoreId>,
    /// `None` if the package id could not be read: such a cpu belongs to no package.
    pub package: Option<PackageId>,
}

/// Identifies a physical core across the whole machine (core ids are only unique within a package).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoreKey {
    Core { package: Option<PackageId>, core: CoreId },
    /// The core is unknown, the cpu stands alone.
    Alone(CpuId),
}

/// Immutable cpu → core/package lookup table, built once at start-up.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    placements: BTreeMap<CpuId, Placement>,
}

impl Topology {
    /// Reads `topology/core_id` and `topology/physical_package_id` of each cpu.
    pub fn from_sysfs(paths: &SysPaths, cpus: &BTreeSet<CpuId>) -> anyhow::Result<Topology> {
        if cpus.is_empty() {
            return Err(anyhow!("no cpu to monitor"));
        }
        let placements = cpus
            .iter()
            .map(|&cpu| {
                let dir = paths.cpu_dir(cpu).join("topology");
                let read_id = |file: &str| {
                    let path = dir.join(file);
                    match read_sysfs(&path).map(|s| s.parse::<i64>()) {
                        Ok(Ok(id)) if id >= 0 => Some(id as u32),
                        other => {
                            debug!("cpu {cpu}: no usable {}: {other:?}", path.display());
                            None
                        }
                    }
                };
                let placement = Placement {
                    core: read_id("core_id"),
                    package: read_id("physical_package_id"),
                };
                (cpu, placement)
            })
            .collect();
        Ok(Topology { placements })
    }

    pub fn from_placements(placements: impl IntoIterator<Item = (CpuId, Placement)>) -> Topology {
        Topology {
            placements: placements.into_iter().collect(),
        }
    }

    pub fn placement(&self, cpu: CpuId) -> Placement {
        self.placements.get(&cpu).copied().unwrap_or_default()
    }

    pub fn core_of(&self, cpu: CpuId) -> Option<CoreId> {
        self.placement(cpu).core
    }

    pub fn package_of(&self, cpu: CpuId) -> Option<PackageId> {
        self.placement(cpu).package
    }

    pub fn core_key(&self, cpu: CpuId) -> CoreKey {
        let p = self.placement(cpu);
        match p.core {
            Some(core) => CoreKey::Core {
                package: p.package,
                core,
            },
            None => CoreKey::Alone(cpu),
        }
    }

    /// The distinct packages covered by `cpus`, each with its representative (lowest) cpu.
    pub fn packages(&self, cpus: &BTreeSet<CpuId>) -> BTreeMap<PackageId, CpuId> {
        let mut res = BTreeMap::new();
        for &cpu in cpus {
            if let Some(pkg) = self.package_of(cpu) {
                res.entry(pkg).or_insert(cpu);
            }
        }
        res
    }

    /// Groups `cpus` by physical core. The first cpu of each group is the one to read from.
    pub fn cores(&self, cpus: &BTreeSet<CpuId>) -> BTreeMap<CoreKey, Vec<CpuId>> {
        let mut res: BTreeMap<CoreKey, Vec<CpuId>> = BTreeMap::new();
        for &cpu in cpus {
            res.entry(self.core_key(cpu)).or_default().push(cpu);
        }
        res
    }
}

/// Retrieves the cpus this process is allowed to run on: the effective cpuset of its cgroup,
/// or all the online cpus when there is none.
pub fn effective_cpus(paths: &SysPaths) -> anyhow::Result<Vec<CpuId>> {
    let cgroup_files = [
        paths.sys.join("fs/cgroup/cpuset.cpus.effective"),
        paths.sys.join("fs/cgroup/cpuset/cpuset.effective_cpus"),
    ];
    for path in &cgroup_files {
        match fs::read_to_string(path) {
            Ok(list) if !list.trim().is_empty() => match parse_cpu_list(&list) {
                Ok(cpus) => return Ok(cpus),
                Err(e) => warn!("invalid cpu list in {}: {e}", path.display()),
            },
            Ok(_) => (),
            Err(e) => debug!("cannot read {}: {e}", path.display()),
        }
    }
    online_cpus(paths)
}

pub fn online_cpus(paths: &SysPaths) -> anyhow::Result<Vec<CpuId>> {
    let path = paths.online_cpus();
    let list = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_cpu_list(&list)
}

/// Keeps the requested cpus that are online, warns about the others.
pub fn select_cpus(requested: &[CpuId], online: &[CpuId]) -> BTreeSet<CpuId> {
    let online: BTreeSet<CpuId> = online.iter().copied().collect();
    let (valid, invalid): (BTreeSet<CpuId>, BTreeSet<CpuId>) =
        requested.iter().copied().partition(|cpu| online.contains(cpu));
    if !invalid.is_empty() {
        warn!("Ignoring cpus that are not online: {invalid:?}");
    }
    valid
}

/// Parses a kernel cpulist, e.g. `0,2,4-7`.
pub fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<CpuId>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<CpuId>> {
        let bounds: Vec<CpuId> = item
            .trim()
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<CpuId>, ParseIntError>>()
            .with_context(|| format!("invalid cpulist item: '{item}'"))?;

        match bounds.as_slice() {
            &[start, end] if start <= end => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow!("invalid cpulist item: '{item}'")),
        }
    }

    let mut cpus: Vec<CpuId> = cpulist
        .trim_end()
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<CpuId>>>>()?
        .into_iter() // not the same as iter() !
        .flatten()
        .collect();
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, fs};

    use super::*;

    #[test]
    fn test_parse_cpulist() -> anyhow::Result<()> {
        assert_eq!(parse_cpu_list("0")?, vec![0]);
        assert_eq!(parse_cpu_list("0,64\n")?, vec![0, 64]);
        assert_eq!(parse_cpu_list("0-1")?, vec![0, 1]);
        assert_eq!(parse_cpu_list("1-3,5-6")?, vec![1, 2, 3, 5, 6]);
        assert_eq!(parse_cpu_list("4-5, 0,2")?, vec![0, 2, 4, 5]);
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a").is_err());
        assert!(parse_cpu_list("1-2-3").is_err());
        Ok(())
    }

    #[test]
    fn select_only_online() {
        let selected = select_cpus(&[0, 2, 9], &[0, 1, 2, 3]);
        assert_eq!(selected, BTreeSet::from([0, 2]));
    }

    fn smt_topology() -> Topology {
        // 2 packages, 2 cores each, 2 threads per core; cpu 8 has no topology info
        let mut placements = Vec::new();
        for cpu in 0..8 {
            placements.push((
                cpu,
                Placement {
                    core: Some(cpu % 2),
                    package: Some(cpu / 4),
                },
            ));
        }
        placements.push((8, Placement::default()));
        Topology::from_placements(placements)
    }

    #[test]
    fn cores_are_scoped_by_package() {
        let topo = smt_topology();
        let cpus: BTreeSet<CpuId> = (0..=8).collect();
        let cores = topo.cores(&cpus);
        assert_eq!(cores.len(), 5);
        assert_eq!(
            cores[&CoreKey::Core {
                package: Some(0),
                core: 1
            }],
            vec![1, 3]
        );
        assert_eq!(
            cores[&CoreKey::Core {
                package: Some(1),
                core: 1
            }],
            vec![5, 7]
        );
        assert_eq!(cores[&CoreKey::Alone(8)], vec![8]);
    }

    #[test]
    fn packages_have_a_representative() {
        let topo = smt_topology();
        let cpus = BTreeSet::from([2, 3, 5, 8]);
        let packages = topo.packages(&cpus);
        assert_eq!(packages, BTreeMap::from([(0, 2), (1, 5)]));
        assert_eq!(topo.package_of(42), None);
    }

    #[test]
    fn topology_and_cpusets_from_sysfs() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let paths = SysPaths::with_root(root.path());
        for (cpu, core, pkg) in [(0, "0", "0"), (1, "0", "0"), (2, "-1", "garbage")] {
            let dir = paths.cpu_dir(cpu).join("topology");
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("core_id"), format!("{core}\n"))?;
            fs::write(dir.join("physical_package_id"), format!("{pkg}\n"))?;
        }
        let cpus = BTreeSet::from([0, 1, 2, 3]);
        let topo = Topology::from_sysfs(&paths, &cpus)?;
        assert_eq!(topo.core_key(0), topo.core_key(1));
        assert_eq!(topo.placement(2), Placement::default());
        assert_eq!(topo.core_key(3), CoreKey::Alone(3));
        assert!(Topology::from_sysfs(&paths, &BTreeSet::new()).is_err());

        fs::write(paths.online_cpus(), "0-3\n")?;
        assert_eq!(effective_cpus(&paths)?, vec![0, 1, 2, 3]);

        fs::create_dir_all(paths.sys.join("fs/cgroup"))?;
        fs::write(paths.sys.join("fs/cgroup/cpuset.cpus.effective"), "1,3\n")?;
        assert_eq!(effective_cpus(&paths)?, vec![1, 3]);
        Ok(())
    }
}
