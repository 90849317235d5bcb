use std::{collections::BTreeMap, time::Instant};

use enum_map::EnumMap;

use crate::{
    field::Field,
    snapshot::{Counter, CpuSnapshot, PackageSnapshot},
    CpuId, PackageId, RaplDomain,
};

/// Replaces a measured interval that is not strictly positive, so that rates stay defined.
pub const EPSILON_SECONDS: f64 = 1e-9;

/// Modulus of an energy accumulator whose maximum range is unknown.
pub const FALLBACK_ENERGY_MODULUS: u64 = 1 << 63;

/// Why two snapshots cannot be turned into a delta.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDelta {
    #[error("snapshots of different entities ({current} and {previous})")]
    EntityMismatch { current: u32, previous: u32 },
    #[error("sample time did not increase and the counters changed")]
    TimeNotIncreasing,
    #[error("{counter} went backwards ({previous} -> {current})")]
    CounterRegressed {
        counter: &'static str,
        previous: u64,
        current: u64,
    },
}

/// Difference of two readings of a 64-bit hardware counter, with at most one wrap-around.
///
/// `(2^64 - prev) + curr` is exactly the wrapping subtraction.
pub fn counter_delta(current: u64, previous: u64) -> u64 {
    current.wrapping_sub(previous)
}

/// Difference of two readings of an energy accumulator that wraps at `max_energy_uj`.
///
/// A missing or zero maximum is replaced by [`FALLBACK_ENERGY_MODULUS`]. A difference larger than
/// the modulus cannot come from a single wrap-around: the readings are inconsistent and the
/// result is forced to 0.
pub fn energy_delta(current: u64, previous: u64, max_energy_uj: Option<u64>) -> u64 {
    let modulus = match max_energy_uj {
        Some(max) if max > 0 => max,
        _ => FALLBACK_ENERGY_MODULUS,
    };
    let delta: u128 = if current >= previous {
        (current - previous) as u128
    } else {
        (modulus as u128).saturating_sub(previous as u128) + current as u128
    };
    if delta > modulus as u128 {
        0
    } else {
        delta as u64
    }
}

/// Duration between two instants, in seconds, never zero.
fn interval_seconds(current: Instant, previous: Instant) -> f64 {
    let secs = current.saturating_duration_since(previous).as_secs_f64();
    if secs > 0.0 {
        secs
    } else {
        EPSILON_SECONDS
    }
}

/// What happened on a cpu during an interval.
///
/// The counters hold the amount accumulated during the interval; the other fields
/// describe the state at the end of the interval.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuDelta {
    pub cpu_id: CpuId,
    /// Duration of the interval, in seconds, strictly positive.
    pub interval: f64,

    pub tsc: u64,
    pub aperf: u64,
    pub mperf: u64,
    pub instructions_retired: u64,
    pub core_cycles: u64,
    pub irq_count: u64,
    /// Time spent in each idle state during the interval, in microseconds.
    pub idle_state_time: BTreeMap<String, u64>,

    pub core_temperature: Field<i32>,
    pub throttled: Field<bool>,
    pub current_frequency_mhz: Field<f64>,
    pub governor: Field<String>,
    pub energy_perf_bias: Field<i64>,
    pub scaling_min_mhz: Field<f64>,
    pub scaling_max_mhz: Field<f64>,
}

/// What happened on a package during an interval.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDelta {
    pub package_id: PackageId,
    /// Duration of the interval, in seconds, strictly positive.
    pub interval: f64,
    pub package_temperature: Field<i32>,
    /// Energy consumed during the interval, in microjoules, `None` if the domain is not measured.
    pub energy_uj: EnumMap<RaplDomain, Option<u64>>,
}

impl PackageDelta {
    pub fn energy_package_uj(&self) -> Option<u64> {
        self.energy_uj[RaplDomain::Package]
    }

    pub fn energy_dram_uj(&self) -> Option<u64> {
        self.energy_uj[RaplDomain::Dram]
    }
}

impl CpuSnapshot {
    fn counters_identical(&self, other: &CpuSnapshot) -> bool {
        self.tsc == other.tsc
            && self.aperf == other.aperf
            && self.mperf == other.mperf
            && self.instructions_retired == other.instructions_retired
            && self.core_cycles == other.core_cycles
            && self.irq_count == other.irq_count
            && self.idle_state_time == other.idle_state_time
    }

    /// Computes what happened between `previous` and `self`.
    ///
    /// The TSC never wraps in practice: if it goes backwards, the snapshots are inconsistent
    /// and no delta is produced. The other counters are allowed to wrap once.
    /// A counter that was unread in either snapshot has a delta of 0.
    pub fn delta(&self, previous: &CpuSnapshot) -> Result<CpuDelta, InvalidDelta> {
        if self.cpu_id != previous.cpu_id {
            return Err(InvalidDelta::EntityMismatch {
                current: self.cpu_id,
                previous: previous.cpu_id,
            });
        }
        if self.sample_time <= previous.sample_time && !self.counters_identical(previous) {
            return Err(InvalidDelta::TimeNotIncreasing);
        }
        let both_read = |c: Counter| !self.unread_counters.contains(&c) && !previous.unread_counters.contains(&c);
        let delta = |c: Counter, now: u64, before: u64| if both_read(c) { counter_delta(now, before) } else { 0 };

        if both_read(Counter::Tsc) && self.tsc < previous.tsc {
            return Err(InvalidDelta::CounterRegressed {
                counter: "tsc",
                previous: previous.tsc,
                current: self.tsc,
            });
        }

        // A state that was not observable before starts from zero.
        let idle_state_time = self
            .idle_state_time
            .iter()
            .map(|(name, &now)| {
                let before = previous.idle_state_time.get(name).copied().unwrap_or(0);
                (name.clone(), counter_delta(now, before))
            })
            .collect();

        Ok(CpuDelta {
            cpu_id: self.cpu_id,
            interval: interval_seconds(self.sample_time, previous.sample_time),
            tsc: delta(Counter::Tsc, self.tsc, previous.tsc),
            aperf: delta(Counter::Aperf, self.aperf, previous.aperf),
            mperf: delta(Counter::Mperf, self.mperf, previous.mperf),
            instructions_retired: delta(
                Counter::InstructionsRetired,
                self.instructions_retired,
                previous.instructions_retired,
            ),
            core_cycles: delta(Counter::CoreCycles, self.core_cycles, previous.core_cycles),
            irq_count: delta(Counter::IrqCount, self.irq_count, previous.irq_count),
            idle_state_time,
            core_temperature: self.core_temperature.clone(),
            throttled: self.throttled.clone(),
            current_frequency_mhz: self.current_frequency_mhz.clone(),
            governor: self.governor.clone(),
            energy_perf_bias: self.energy_perf_bias.clone(),
            scaling_min_mhz: self.scaling_min_mhz.clone(),
            scaling_max_mhz: self.scaling_max_mhz.clone(),
        })
    }
}

impl PackageSnapshot {
    fn counters_identical(&self, other: &PackageSnapshot) -> bool {
        RaplDomain::ALL.iter().all(|&d| {
            let energy = |s: &PackageSnapshot| s.energy[d].as_ref().map(|e| e.energy_uj);
            energy(self) == energy(other)
        })
    }

    /// Computes the energy consumed between `previous` and `self`.
    ///
    /// The modulus of each accumulator is taken from `self`.
    pub fn delta(&self, previous: &PackageSnapshot) -> Result<PackageDelta, InvalidDelta> {
        if self.package_id != previous.package_id {
            return Err(InvalidDelta::EntityMismatch {
                current: self.package_id,
                previous: previous.package_id,
            });
        }
        if self.sample_time <= previous.sample_time && !self.counters_identical(previous) {
            return Err(InvalidDelta::TimeNotIncreasing);
        }

        let mut energy_uj = EnumMap::default();
        for domain in RaplDomain::ALL {
            if let (Some(now), Some(before)) = (&self.energy[domain], &previous.energy[domain]) {
                let max = now.max_energy_uj.get();
                energy_uj[domain] = Some(energy_delta(now.energy_uj, before.energy_uj, max));
            }
        }

        Ok(PackageDelta {
            package_id: self.package_id,
            interval: interval_seconds(self.sample_time, previous.sample_time),
            package_temperature: self.package_temperature.clone(),
            energy_uj,
        })
    }
}
