use std::collections::BTreeMap;

use clap::ValueEnum;

use crate::delta::{CpuDelta, PackageDelta};

/// Which counter measures the elapsed core cycles, as the denominator of the IPC.
///
/// Both are valid proxies: APERF counts at the actual frequency while the cpu is in C0,
/// FIXED_CTR1 counts unhalted core cycles but must be enabled first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum IpcReference {
    #[default]
    Aperf,
    CoreCycles,
}

/// How to compute the average frequency while the cpu is busy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BusyFrequency {
    /// `avg_mhz / busy fraction`, 0 when the cpu was almost never busy.
    #[default]
    BusyFraction,
    /// `aperf / mperf * tsc_mhz`
    #[value(name = "aperf-mperf")]
    AperfMperfRatio,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsConfig {
    pub ipc_reference: IpcReference,
    pub busy_frequency: BusyFrequency,
    /// Below this busy percentage, the busy frequency is reported as 0.
    pub busy_threshold_percent: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            ipc_reference: IpcReference::default(),
            busy_frequency: BusyFrequency::default(),
            busy_threshold_percent: 0.01,
        }
    }
}

/// Rates of a package during an interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PackageMetrics {
    pub package_watts: f64,
    pub dram_watts: f64,
}

/// Rates and percentages of a cpu during an interval. Never NaN nor infinite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuMetrics {
    pub busy_percent: f64,
    pub avg_mhz: f64,
    pub bzy_mhz: f64,
    pub tsc_mhz: f64,
    pub ipc: f64,
    /// Occupancy of each idle state, in `[0, 100]`.
    pub idle_percent: BTreeMap<String, f64>,
    /// Power of the package that contains the cpu, 0 if unknown.
    pub package_watts: f64,
    pub dram_watts: f64,
}

/// `numerator / denominator`, or 0 if the result would not be a finite number.
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let r = numerator / denominator;
    if r.is_finite() {
        r
    } else {
        0.0
    }
}

impl PackageMetrics {
    pub fn derive(d: &PackageDelta) -> PackageMetrics {
        let watts = |uj: Option<u64>| uj.map_or(0.0, |uj| ratio(uj as f64 / 1e6, d.interval));
        PackageMetrics {
            package_watts: watts(d.energy_package_uj()),
            dram_watts: watts(d.energy_dram_uj()),
        }
    }
}

impl CpuMetrics {
    /// Derives the metrics of a cpu from its delta, and from the delta of its package if there is one.
    pub fn derive(d: &CpuDelta, package: Option<&PackageDelta>, config: &MetricsConfig) -> CpuMetrics {
        let tsc = d.tsc as f64;
        let aperf = d.aperf as f64;
        let mperf = d.mperf as f64;

        let busy_percent = ratio(100.0 * mperf, tsc);
        let avg_mhz = ratio(aperf, d.interval) / 1e6;
        let tsc_mhz = ratio(tsc, d.interval) / 1e6;
        let bzy_mhz = match config.busy_frequency {
            BusyFrequency::BusyFraction if busy_percent > config.busy_threshold_percent => {
                ratio(avg_mhz, busy_percent / 100.0)
            }
            BusyFrequency::BusyFraction => 0.0,
            BusyFrequency::AperfMperfRatio => ratio(aperf, mperf) * tsc_mhz,
        };

        let cycles = match config.ipc_reference {
            IpcReference::Aperf => d.aperf,
            IpcReference::CoreCycles => d.core_cycles,
        };
        let ipc = ratio(d.instructions_retired as f64, cycles as f64);

        // residency counters can over-report a little compared to the sampling window
        let interval_us = d.interval * 1e6;
        let idle_percent = d
            .idle_state_time
            .iter()
            .map(|(name, &us)| (name.clone(), ratio(100.0 * us as f64, interval_us).clamp(0.0, 100.0)))
            .collect();

        let PackageMetrics {
            package_watts,
            dram_watts,
        } = package.map(PackageMetrics::derive).unwrap_or_default();

        CpuMetrics {
            busy_percent,
            avg_mhz,
            bzy_mhz,
            tsc_mhz,
            ipc,
            idle_percent,
            package_watts,
            dram_watts,
        }
    }
}
