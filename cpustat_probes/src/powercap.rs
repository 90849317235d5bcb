// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use enum_map::EnumMap;
use log::{debug, warn};
use regex::Regex;

use crate::{source::read_sysfs, PackageId, RaplDomain};

/// A RAPL power zone that holds an energy accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaplZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `dram`.
    pub name: String,

    /// The path of the zone in sysfs, for instance `/sys/class/powercap/intel-rapl:0`.
    pub path: PathBuf,

    /// The package that contains this zone, `None` if it cannot be determined.
    pub package: Option<PackageId>,
}

impl RaplZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    /// The accumulator wraps to zero when it reaches this value.
    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }
}

impl Display for RaplZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let package = self.package.map_or("?".to_owned(), |p| p.to_string());
        write!(f, "- {} (package {package}) \t\t: {}", self.name, self.path.to_string_lossy())
    }
}

/// RAPL zones of each domain, discovered once at start-up.
#[derive(Debug, Clone, Default)]
pub struct RaplDomains {
    zones: EnumMap<RaplDomain, Vec<RaplZone>>,
}

impl RaplDomains {
    /// Discovers the package and DRAM zones under `powercap_root` (usually `/sys/class/powercap`).
    ///
    /// A missing powercap directory is not an error, it yields no zone.
    pub fn discover(powercap_root: &Path) -> anyhow::Result<RaplDomains> {
        let mut domains = RaplDomains::default();
        if !powercap_root.is_dir() {
            warn!("{} not found, no RAPL energy will be reported", powercap_root.display());
            return Ok(domains);
        }

        // intel-rapl:<package> and intel-rapl:<package>:<subzone>
        let zone_regex = Regex::new(r"^intel-rapl:(\d+)(?::(\d+))?$")?;

        let read_dir = fs::read_dir(powercap_root)
            .with_context(|| format!("failed to list {}", powercap_root.display()))?;
        for e in read_dir {
            let entry = e?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(captures) = zone_regex.captures(&file_name) else {
                continue;
            };
            let path = entry.path();
            if !path.join("energy_uj").exists() || !path.join("max_energy_range_uj").exists() {
                debug!("ignoring zone without energy counter: {}", path.display());
                continue;
            }
            let name = match read_sysfs(&path.join("name")) {
                Ok(name) => name,
                Err(e) => {
                    debug!("ignoring unnamed zone {}: {e}", path.display());
                    continue;
                }
            };
            let top_index: Option<PackageId> = captures.get(1).and_then(|m| m.as_str().parse().ok());
            let is_subzone = captures.get(2).is_some();

            let domain = match (is_subzone, name.as_str()) {
                (false, n) if n.starts_with("package") => RaplDomain::Package,
                (true, "dram") => RaplDomain::Dram,
                _ => continue,
            };
            // The package id is in the name of top zones ("package-1"), otherwise it is the index of the parent.
            let package = match domain {
                RaplDomain::Package => name
                    .strip_prefix("package-")
                    .and_then(|id| id.parse().ok())
                    .or(top_index),
                RaplDomain::Dram => top_index,
            };
            domains.zones[domain].push(RaplZone { name, path, package });
        }

        for zones in domains.zones.values_mut() {
            zones.sort_by_key(|z| (z.package, z.path.clone()));
            zones.dedup_by_key(|z| z.package);
        }
        Ok(domains)
    }

    pub fn from_zones(zones: impl IntoIterator<Item = (RaplDomain, RaplZone)>) -> RaplDomains {
        let mut domains = RaplDomains::default();
        for (domain, zone) in zones {
            domains.zones[domain].push(zone);
        }
        domains
    }

    pub fn zones(&self, domain: RaplDomain) -> &[RaplZone] {
        &self.zones[domain]
    }

    /// Finds the zone of `domain` that belongs to `package`.
    ///
    /// On a single-package machine, a lone zone with an unknown package is attributed to that package.
    pub fn zone_for(&self, domain: RaplDomain, package: PackageId, package_count: usize) -> Option<&RaplZone> {
        let zones = &self.zones[domain];
        zones.iter().find(|z| z.package == Some(package)).or_else(|| match zones.as_slice() {
            [lone] if lone.package.is_none() && package_count == 1 => Some(lone),
            _ => None,
        })
    }
}
