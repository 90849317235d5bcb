use std::{
    collections::{BTreeMap, BTreeSet},
    time::Instant,
};

use enum_map::EnumMap;
use log::debug;

use crate::{
    cpuidle::IdleStateTable,
    field::{Field, FieldError},
    interrupts::parse_interrupts,
    msr::{self, intel, DEFAULT_TJMAX},
    powercap::RaplDomains,
    source::RegisterSource,
    topology::Topology,
    CpuId, PackageId, RaplDomain, SysPaths,
};

/// Raw state of one logical cpu at one instant.
///
/// The counters are cumulative totals. A counter that could not be read is 0 and listed in
/// `unread_counters` (the failure is also recorded in the [`SnapshotSet`]), the other fields
/// are explicitly absent.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuSnapshot {
    pub cpu_id: CpuId,
    pub sample_time: Instant,

    pub tsc: u64,
    pub aperf: u64,
    pub mperf: u64,
    pub instructions_retired: u64,
    pub core_cycles: u64,
    pub irq_count: u64,
    /// Cumulative residency of each idle state, in microseconds.
    pub idle_state_time: BTreeMap<String, u64>,
    /// Counters whose value is a 0 placeholder.
    pub unread_counters: BTreeSet<Counter>,

    /// Temperature of the core, in °C.
    pub core_temperature: Field<i32>,
    pub throttled: Field<bool>,
    pub current_frequency_mhz: Field<f64>,
    pub governor: Field<String>,
    pub energy_perf_bias: Field<i64>,
    pub scaling_min_mhz: Field<f64>,
    pub scaling_max_mhz: Field<f64>,
}

/// A cumulative counter of a [`CpuSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    Tsc,
    Aperf,
    Mperf,
    InstructionsRetired,
    CoreCycles,
    IrqCount,
}

impl Counter {
    pub fn name(self) -> &'static str {
        match self {
            Counter::Tsc => "tsc",
            Counter::Aperf => "aperf",
            Counter::Mperf => "mperf",
            Counter::InstructionsRetired => "instructions_retired",
            Counter::CoreCycles => "core_cycles",
            Counter::IrqCount => "irq_count",
        }
    }
}

/// Raw value of a RAPL energy accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyReading {
    pub energy_uj: u64,
    /// The modulus of the accumulator.
    pub max_energy_uj: Field<u64>,
}

/// Raw state of one physical package at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSnapshot {
    pub package_id: PackageId,
    pub sample_time: Instant,
    pub package_temperature: Field<i32>,
    /// `None` when the package has no RAPL zone for this domain, or when its accumulator could not be read.
    pub energy: EnumMap<RaplDomain, Option<EnergyReading>>,
}

impl PackageSnapshot {
    pub fn energy_package_uj(&self) -> Option<u64> {
        self.energy[RaplDomain::Package].as_ref().map(|e| e.energy_uj)
    }

    pub fn energy_dram_uj(&self) -> Option<u64> {
        self.energy[RaplDomain::Dram].as_ref().map(|e| e.energy_uj)
    }
}

/// What has been sampled, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Entity {
    Cpu(CpuId),
    Package(PackageId),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Cpu(id) => write!(f, "cpu {id}"),
            Entity::Package(id) => write!(f, "package {id}"),
        }
    }
}

/// A field that could not be read during a sampling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    pub entity: Entity,
    pub field: String,
    pub error: FieldError,
}

/// A complete sampling pass: one snapshot per requested cpu, one per distinct package.
#[derive(Debug, Clone)]
pub struct SnapshotSet {
    pub sample_time: Instant,
    pub cpus: BTreeMap<CpuId, CpuSnapshot>,
    pub packages: BTreeMap<PackageId, PackageSnapshot>,
    pub failures: Vec<FieldFailure>,
}

/// Values that describe a physical core, read once and shared by its sibling threads.
#[derive(Clone)]
struct CoreReadings {
    temperature: Field<i32>,
    throttled: Field<bool>,
    idle_state_time: BTreeMap<String, u64>,
}

/// Builds [`SnapshotSet`]s from live reads.
///
/// The lookup tables (topology, idle states, RAPL zones) are discovered once, before the first pass.
pub struct SnapshotBuilder<S> {
    source: S,
    topology: Topology,
    paths: SysPaths,
    idle_states: IdleStateTable,
    rapl: RaplDomains,
    tjmax: u32,
}

impl<S: RegisterSource> SnapshotBuilder<S> {
    pub fn new(source: S, topology: Topology, paths: SysPaths) -> SnapshotBuilder<S> {
        SnapshotBuilder {
            source,
            topology,
            paths,
            idle_states: IdleStateTable::default(),
            rapl: RaplDomains::default(),
            tjmax: DEFAULT_TJMAX,
        }
    }

    pub fn with_idle_states(mut self, idle_states: IdleStateTable) -> Self {
        self.idle_states = idle_states;
        self
    }

    pub fn with_rapl(mut self, rapl: RaplDomains) -> Self {
        self.rapl = rapl;
        self
    }

    pub fn with_tjmax(mut self, tjmax: u32) -> Self {
        self.tjmax = tjmax;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn idle_states(&self) -> &IdleStateTable {
        &self.idle_states
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Samples every cpu of `cpus`, and every package they belong to, now.
    pub fn build(&self, cpus: &BTreeSet<CpuId>) -> SnapshotSet {
        self.build_at(cpus, Instant::now())
    }

    /// Samples every cpu of `cpus`, and every package they belong to, tagging the snapshots with `at`.
    pub fn build_at(&self, cpus: &BTreeSet<CpuId>, at: Instant) -> SnapshotSet {
        let mut pass = Pass {
            source: &self.source,
            failures: Vec::new(),
        };

        let packages = self.topology.packages(cpus);
        let package_snapshots = packages
            .iter()
            .map(|(&pkg, &rep_cpu)| (pkg, self.read_package(&mut pass, pkg, rep_cpu, packages.len(), at)))
            .collect();

        // per-core values: one read per core, replicated to all the threads of that core
        let mut core_values: BTreeMap<CpuId, CoreReadings> = BTreeMap::new();
        for siblings in self.topology.cores(cpus).values() {
            let Some(&rep_cpu) = siblings.first() else {
                continue;
            };
            let readings = self.read_core(&mut pass, rep_cpu);
            for &cpu in siblings {
                core_values.insert(cpu, readings.clone());
            }
        }

        let irqs = pass
            .source
            .read_scalar(&self.paths.interrupts())
            .and_then(|content| parse_interrupts(&content));

        let cpu_snapshots = cpus
            .iter()
            .map(|&cpu| {
                let core = core_values.remove(&cpu).unwrap_or_else(|| CoreReadings {
                    temperature: Field::Absent(FieldError::Unmapped),
                    throttled: Field::Absent(FieldError::Unmapped),
                    idle_state_time: BTreeMap::new(),
                });
                let irq_count = match &irqs {
                    Ok(counts) => counts.get(&cpu).copied().ok_or(FieldError::Unmapped),
                    Err(e) => Err(e.clone()),
                };
                (cpu, self.read_cpu(&mut pass, cpu, core, irq_count, at))
            })
            .collect();

        SnapshotSet {
            sample_time: at,
            cpus: cpu_snapshots,
            packages: package_snapshots,
            failures: pass.failures,
        }
    }

    fn read_cpu(
        &self,
        pass: &mut Pass<'_, S>,
        cpu: CpuId,
        core: CoreReadings,
        irq_count: Result<u64, FieldError>,
        at: Instant,
    ) -> CpuSnapshot {
        let mhz = |khz: Result<i64, FieldError>| khz.map(|f| f as f64 / 1000.0);
        let p = &self.paths;
        let source = pass.source;
        let mut unread = BTreeSet::new();
        let mut counter = |counter: Counter, value: Result<u64, FieldError>| {
            pass.counter(cpu, counter, value, &mut unread)
        };
        let tsc = counter(Counter::Tsc, source.read_counter(cpu, intel::MSR_IA32_TSC));
        let aperf = counter(Counter::Aperf, source.read_counter(cpu, intel::MSR_IA32_APERF));
        let mperf = counter(Counter::Mperf, source.read_counter(cpu, intel::MSR_IA32_MPERF));
        let instructions_retired =
            counter(Counter::InstructionsRetired, source.read_counter(cpu, intel::MSR_IA32_FIXED_CTR0));
        let core_cycles = counter(Counter::CoreCycles, source.read_counter(cpu, intel::MSR_IA32_FIXED_CTR1));
        let irq_count = counter(Counter::IrqCount, irq_count);

        CpuSnapshot {
            cpu_id: cpu,
            sample_time: at,
            tsc,
            aperf,
            mperf,
            instructions_retired,
            core_cycles,
            irq_count,
            idle_state_time: core.idle_state_time,
            unread_counters: unread,
            core_temperature: core.temperature,
            throttled: core.throttled,
            current_frequency_mhz: pass.scalar(
                cpu,
                "current_frequency_mhz",
                mhz(source.read_int(&p.cpufreq(cpu, "scaling_cur_freq"))),
            ),
            governor: pass.scalar(cpu, "governor", source.read_scalar(&p.cpufreq(cpu, "scaling_governor"))),
            energy_perf_bias: pass.scalar(cpu, "energy_perf_bias", source.read_int(&p.energy_perf_bias(cpu))),
            scaling_min_mhz: pass.scalar(
                cpu,
                "scaling_min_mhz",
                mhz(source.read_int(&p.cpufreq(cpu, "scaling_min_freq"))),
            ),
            scaling_max_mhz: pass.scalar(
                cpu,
                "scaling_max_mhz",
                mhz(source.read_int(&p.cpufreq(cpu, "scaling_max_freq"))),
            ),
        }
    }

    fn read_core(&self, pass: &mut Pass<'_, S>, rep_cpu: CpuId) -> CoreReadings {
        let status = pass.source.read_counter(rep_cpu, intel::MSR_IA32_THERM_STATUS);
        if let Err(e) = &status {
            pass.fail(Entity::Cpu(rep_cpu), "core_temperature", e.clone());
        }
        let mut idle_state_time = BTreeMap::new();
        for state in self.idle_states.states_of(rep_cpu) {
            match pass.source.read_u64(&state.time_path) {
                Ok(us) => {
                    idle_state_time.insert(state.name.clone(), us);
                }
                Err(e) => pass.fail(Entity::Cpu(rep_cpu), &format!("idle_state_time[{}]", state.name), e),
            }
        }
        CoreReadings {
            temperature: status.clone().map(|s| msr::decode_temperature(s, self.tjmax)).into(),
            throttled: status.map(msr::decode_throttled).into(),
            idle_state_time,
        }
    }

    fn read_package(
        &self,
        pass: &mut Pass<'_, S>,
        pkg: PackageId,
        rep_cpu: CpuId,
        package_count: usize,
        at: Instant,
    ) -> PackageSnapshot {
        let entity = Entity::Package(pkg);
        let status = pass.source.read_counter(rep_cpu, intel::MSR_IA32_PACKAGE_THERM_STATUS);
        if let Err(e) = &status {
            pass.fail(entity, "package_temperature", e.clone());
        }

        let mut energy = EnumMap::default();
        for domain in RaplDomain::ALL {
            let Some(zone) = self.rapl.zone_for(domain, pkg, package_count) else {
                continue;
            };
            let max_energy_uj: Field<u64> = pass.source.read_u64(&zone.max_energy_path()).into();
            if let Some(e) = max_energy_uj.error() {
                pass.fail(entity, &format!("max_energy_{domain}_uj"), e.clone());
            }
            // an unreadable accumulator leaves the domain unmeasured for the intervals on both sides
            match pass.source.read_u64(&zone.energy_path()) {
                Ok(energy_uj) => {
                    energy[domain] = Some(EnergyReading {
                        energy_uj,
                        max_energy_uj,
                    })
                }
                Err(e) => pass.fail(entity, &format!("energy_{domain}_uj"), e),
            }
        }

        PackageSnapshot {
            package_id: pkg,
            sample_time: at,
            package_temperature: status.map(|s| msr::decode_temperature(s, self.tjmax)).into(),
            energy,
        }
    }
}

/// State of one sampling pass.
struct Pass<'a, S> {
    source: &'a S,
    failures: Vec<FieldFailure>,
}

impl<S: RegisterSource> Pass<'_, S> {
    fn fail(&mut self, entity: Entity, field: &str, error: FieldError) {
        debug!("{entity}: cannot read {field}: {error}");
        self.failures.push(FieldFailure {
            entity,
            field: field.to_owned(),
            error,
        });
    }

    /// Unwraps a counter read, 0 and marked unread if it failed.
    fn counter(
        &mut self,
        cpu: CpuId,
        counter: Counter,
        value: Result<u64, FieldError>,
        unread: &mut BTreeSet<Counter>,
    ) -> u64 {
        value.unwrap_or_else(|e| {
            self.fail(Entity::Cpu(cpu), counter.name(), e);
            unread.insert(counter);
            0
        })
    }

    /// Turns a scalar read into a field, recording the failure if there is one.
    fn scalar<T>(&mut self, cpu: CpuId, field: &str, value: Result<T, FieldError>) -> Field<T> {
        if let Err(e) = &value {
            self.fail(Entity::Cpu(cpu), field, e.clone());
        }
        value.into()
    }
}
