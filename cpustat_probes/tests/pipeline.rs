use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

use cpustat_probes::{
    cpuidle::{IdleState, IdleStateTable},
    field::{Field, FieldError},
    metrics::MetricsConfig,
    msr::{intel, Addr},
    powercap::{RaplDomains, RaplZone},
    sampler::Sampler,
    snapshot::{Entity, SnapshotBuilder},
    source::RegisterSource,
    topology::{Placement, Topology},
    CpuId, RaplDomain, SysPaths,
};

/// In-memory registers and files, that count the register reads.
#[derive(Default)]
struct FakeRegisters {
    counters: Mutex<HashMap<(CpuId, Addr), u64>>,
    scalars: Mutex<HashMap<PathBuf, String>>,
    reads: Mutex<HashMap<(CpuId, Addr), usize>>,
}

impl FakeRegisters {
    fn set(&self, cpu: CpuId, addr: Addr, value: u64) {
        self.counters.lock().unwrap().insert((cpu, addr), value);
    }

    fn set_file(&self, path: impl Into<PathBuf>, content: impl ToString) {
        self.scalars.lock().unwrap().insert(path.into(), content.to_string());
    }

    /// Makes a register or a file unreadable.
    fn remove(&self, cpu: CpuId, addr: Addr) {
        self.counters.lock().unwrap().remove(&(cpu, addr));
    }

    fn remove_file(&self, path: impl AsRef<Path>) {
        self.scalars.lock().unwrap().remove(path.as_ref());
    }

    fn reads(&self, cpu: CpuId, addr: Addr) -> usize {
        self.reads.lock().unwrap().get(&(cpu, addr)).copied().unwrap_or(0)
    }
}

impl RegisterSource for FakeRegisters {
    fn read_counter(&self, cpu: CpuId, address: Addr) -> Result<u64, FieldError> {
        *self.reads.lock().unwrap().entry((cpu, address)).or_default() += 1;
        self.counters
            .lock()
            .unwrap()
            .get(&(cpu, address))
            .copied()
            .ok_or(FieldError::PermissionDenied)
    }

    fn read_scalar(&self, path: &Path) -> Result<String, FieldError> {
        self.scalars.lock().unwrap().get(path).cloned().ok_or(FieldError::NotFound)
    }
}

impl RegisterSource for &FakeRegisters {
    fn read_counter(&self, cpu: CpuId, address: Addr) -> Result<u64, FieldError> {
        (**self).read_counter(cpu, address)
    }

    fn read_scalar(&self, path: &Path) -> Result<String, FieldError> {
        (**self).read_scalar(path)
    }
}

/// cpus 0 and 1 are the two threads of core 0, package 0; cpu 2 is core 0 of package 1.
fn topology() -> Topology {
    Topology::from_placements([
        (0, Placement { core: Some(0), package: Some(0) }),
        (1, Placement { core: Some(0), package: Some(0) }),
        (2, Placement { core: Some(0), package: Some(1) }),
    ])
}

fn rapl_zone(package: u32) -> RaplZone {
    RaplZone {
        name: format!("package-{package}"),
        path: PathBuf::from(format!("/fake/powercap/intel-rapl:{package}")),
        package: Some(package),
    }
}

fn idle_states() -> IdleStateTable {
    let states = |cpu: CpuId| {
        vec![IdleState {
            index: 1,
            name: "C6".to_owned(),
            time_path: PathBuf::from(format!("/fake/cpu{cpu}/state1/time")),
        }]
    };
    IdleStateTable::from_states([(0, states(0)), (1, states(1)), (2, states(2))])
}

fn interrupts(counts: [u64; 3]) -> String {
    format!(
        "           CPU0       CPU1       CPU2\nLOC:  {}  {}  {}   Local timer interrupts\n",
        counts[0], counts[1], counts[2]
    )
}

struct Counters {
    tsc: u64,
    aperf: u64,
    mperf: u64,
    instr: u64,
}

fn set_counters(regs: &FakeRegisters, cpu: CpuId, c: Counters) {
    regs.set(cpu, intel::MSR_IA32_TSC, c.tsc);
    regs.set(cpu, intel::MSR_IA32_APERF, c.aperf);
    regs.set(cpu, intel::MSR_IA32_MPERF, c.mperf);
    regs.set(cpu, intel::MSR_IA32_FIXED_CTR0, c.instr);
}

fn sampler<'a>(regs: &'a FakeRegisters, paths: &SysPaths) -> Sampler<&'a FakeRegisters> {
    let rapl = RaplDomains::from_zones([(RaplDomain::Package, rapl_zone(0)), (RaplDomain::Package, rapl_zone(1))]);
    let builder = SnapshotBuilder::new(regs, topology(), paths.clone())
        .with_idle_states(idle_states())
        .with_rapl(rapl)
        .with_tjmax(100);
    Sampler::new(builder, BTreeSet::from([0, 1, 2]), MetricsConfig::default()).unwrap()
}

#[test]
fn two_intervals_end_to_end() {
    let regs = FakeRegisters::default();
    let paths = SysPaths::with_root(Path::new("/fake"));
    let pkg0 = rapl_zone(0);
    regs.set_file(pkg0.max_energy_path(), 1_000_000_000);
    regs.set_file(pkg0.energy_path(), 999_000_000);
    regs.set_file(paths.interrupts(), interrupts([10, 20, 30]));
    regs.set_file(paths.cpufreq(0, "scaling_cur_freq"), 2_400_000);
    regs.set_file(paths.cpufreq(0, "scaling_governor"), "performance");
    regs.set_file("/fake/cpu0/state1/time", 100);
    regs.set(0, intel::MSR_IA32_THERM_STATUS, 40 << 16);
    for cpu in 0..3 {
        set_counters(&regs, cpu, Counters { tsc: 1_000_000, aperf: 500_000, mperf: 800_000, instr: 200_000 });
    }

    let mut sampler = sampler(&regs, &paths);
    let t0 = Instant::now();
    assert!(sampler.sample_at(t0).is_none());

    set_counters(&regs, 0, Counters { tsc: 2_000_000, aperf: 1_000_000, mperf: 1_600_000, instr: 500_000 });
    set_counters(&regs, 1, Counters { tsc: 2_000_000, aperf: 600_000, mperf: 900_000, instr: 300_000 });
    set_counters(&regs, 2, Counters { tsc: 2_000_000, aperf: 500_000, mperf: 800_000, instr: 200_000 });
    // the package accumulator wraps: 1 J before the wrap, 4 J after
    regs.set_file(pkg0.energy_path(), 4_000_000);
    regs.set_file(paths.interrupts(), interrupts([15, 20, 31]));
    regs.set_file("/fake/cpu0/state1/time", 100_100);

    let report = sampler.sample_at(t0 + Duration::from_secs(1)).expect("second pass reports");
    assert!(report.skipped.is_empty());
    assert_eq!(report.cpus.len(), 3);
    assert_eq!(report.packages.len(), 2);

    let cpu0 = &report.cpus[0];
    assert_eq!(cpu0.cpu_id, 0);
    assert_eq!(cpu0.delta.tsc, 1_000_000);
    assert_eq!(cpu0.delta.irq_count, 5);
    assert_eq!(cpu0.delta.interval, 1.0);
    assert_eq!(cpu0.metrics.busy_percent, 80.0);
    assert_eq!(cpu0.metrics.avg_mhz, 0.5);
    assert_eq!(cpu0.metrics.tsc_mhz, 1.0);
    assert!((cpu0.metrics.ipc - 0.6).abs() < 1e-12);
    assert_eq!(cpu0.metrics.idle_percent["C6"], 10.0);
    assert_eq!(cpu0.metrics.package_watts, 5.0);
    assert_eq!(cpu0.delta.core_temperature, Field::Present(60));
    assert_eq!(cpu0.delta.current_frequency_mhz, Field::Present(2400.0));
    assert_eq!(cpu0.delta.governor, Field::Present("performance".to_owned()));

    // cpu 1 shares the core of cpu 0, cpu 2 is idle and its package has no readable energy
    let cpu1 = &report.cpus[1];
    assert_eq!(cpu1.delta.core_temperature, Field::Present(60));
    assert_eq!(cpu1.metrics.idle_percent["C6"], 10.0);
    let cpu2 = &report.cpus[2];
    assert_eq!(cpu2.metrics.busy_percent, 0.0);
    assert_eq!(cpu2.metrics.ipc, 0.0);
    assert_eq!(cpu2.metrics.package_watts, 0.0);
    assert_eq!(cpu2.delta.irq_count, 1);
}

#[test]
fn core_values_are_read_once_per_core() {
    let regs = FakeRegisters::default();
    let paths = SysPaths::with_root(Path::new("/fake"));
    regs.set(0, intel::MSR_IA32_THERM_STATUS, (35 << 16) | 1);
    regs.set(1, intel::MSR_IA32_THERM_STATUS, 10 << 16);

    let sampler = sampler(&regs, &paths);
    let set = sampler.builder().build(sampler.cpus());

    assert_eq!(regs.reads(0, intel::MSR_IA32_THERM_STATUS), 1);
    assert_eq!(regs.reads(1, intel::MSR_IA32_THERM_STATUS), 0);
    assert_eq!(regs.reads(2, intel::MSR_IA32_THERM_STATUS), 1);
    assert_eq!(set.cpus[&0].core_temperature, Field::Present(65));
    assert_eq!(set.cpus[&1].core_temperature, Field::Present(65));
    assert_eq!(set.cpus[&1].throttled, Field::Present(true));
    assert_eq!(set.cpus[&0].throttled, set.cpus[&1].throttled);
    // package thermal status is read once per package, on its first cpu
    assert_eq!(regs.reads(0, intel::MSR_IA32_PACKAGE_THERM_STATUS), 1);
    assert_eq!(regs.reads(1, intel::MSR_IA32_PACKAGE_THERM_STATUS), 0);
    assert_eq!(regs.reads(2, intel::MSR_IA32_PACKAGE_THERM_STATUS), 1);
}

#[test]
fn failing_fields_do_not_abort_the_pass() {
    let regs = FakeRegisters::default();
    let paths = SysPaths::with_root(Path::new("/fake"));
    set_counters(&regs, 0, Counters { tsc: 10, aperf: 10, mperf: 10, instr: 10 });

    let sampler = sampler(&regs, &paths);
    let set = sampler.builder().build(sampler.cpus());

    assert_eq!(set.cpus.len(), 3);
    assert_eq!(set.packages.len(), 2);
    assert_eq!(set.cpus[&0].tsc, 10);
    assert_eq!(set.cpus[&2].tsc, 0);
    assert_eq!(set.cpus[&2].governor, Field::Absent(FieldError::NotFound));
    assert_eq!(set.cpus[&2].core_temperature, Field::Absent(FieldError::PermissionDenied));
    assert!(set.cpus[&2].idle_state_time.is_empty());
    // the zone exists but its accumulator cannot be read
    assert!(set.packages[&1].energy[RaplDomain::Package].is_none());
    assert!(set.packages[&1].energy[RaplDomain::Dram].is_none());

    let failed = |entity: Entity, field: &str| set.failures.iter().any(|f| f.entity == entity && f.field == field);
    assert!(failed(Entity::Cpu(2), "tsc"));
    assert!(failed(Entity::Cpu(1), "irq_count"));
    assert!(failed(Entity::Cpu(2), "governor"));
    assert!(failed(Entity::Cpu(2), "current_frequency_mhz"));
    assert!(failed(Entity::Cpu(0), "scaling_max_mhz"));
    assert!(failed(Entity::Package(0), "energy_package_uj"));
    assert!(!failed(Entity::Cpu(0), "tsc"));
}

#[test]
fn unreadable_counters_measure_nothing() {
    let regs = FakeRegisters::default();
    let paths = SysPaths::with_root(Path::new("/fake"));
    let pkg0 = rapl_zone(0);
    regs.set_file(pkg0.max_energy_path(), 262_143_328_850u64);
    regs.set_file(pkg0.energy_path(), 100_000_000_000u64);
    regs.set_file(paths.interrupts(), interrupts([10, 20, 30]));
    for cpu in 0..3 {
        set_counters(&regs, cpu, Counters { tsc: 1_000_000, aperf: 5_000_000_000, mperf: 800_000, instr: 0 });
    }
    let mut sampler = sampler(&regs, &paths);
    let t0 = Instant::now();
    sampler.sample_at(t0);

    // APERF of cpu 0 and the package energy fail, the rest moves on
    regs.remove(0, intel::MSR_IA32_APERF);
    regs.remove_file(pkg0.energy_path());
    regs.remove_file(paths.interrupts());
    set_counters(&regs, 1, Counters { tsc: 2_000_000, aperf: 5_000_500_000, mperf: 900_000, instr: 0 });
    regs.set(0, intel::MSR_IA32_TSC, 2_000_000);
    let report = sampler.sample_at(t0 + Duration::from_secs(1)).expect("report");
    assert!(report.skipped.is_empty());

    let cpu0 = &report.cpus[0];
    assert_eq!(cpu0.delta.tsc, 1_000_000);
    assert_eq!(cpu0.delta.aperf, 0);
    assert_eq!(cpu0.delta.irq_count, 0);
    assert_eq!(cpu0.metrics.avg_mhz, 0.0);
    assert_eq!(cpu0.metrics.package_watts, 0.0);
    assert_eq!(report.cpus[1].delta.aperf, 500_000);
    assert_eq!(report.packages[0].delta.energy_package_uj(), None);

    // the interval that follows a failed read is not measured either
    regs.set(0, intel::MSR_IA32_APERF, 5_000_300_000);
    regs.set(0, intel::MSR_IA32_TSC, 3_000_000);
    regs.set_file(pkg0.energy_path(), 101_000_000_000u64);
    regs.set_file(paths.interrupts(), interrupts([12, 20, 30]));
    let report = sampler.sample_at(t0 + Duration::from_secs(2)).expect("report");
    assert_eq!(report.cpus[0].delta.aperf, 0);
    assert_eq!(report.cpus[0].delta.irq_count, 0);
    assert_eq!(report.cpus[0].metrics.package_watts, 0.0);

    // both sides readable again
    regs.set(0, intel::MSR_IA32_APERF, 5_000_700_000);
    regs.set(0, intel::MSR_IA32_TSC, 4_000_000);
    regs.set_file(pkg0.energy_path(), 103_000_000_000u64);
    regs.set_file(paths.interrupts(), interrupts([17, 20, 30]));
    let report = sampler.sample_at(t0 + Duration::from_secs(3)).expect("report");
    assert_eq!(report.cpus[0].delta.aperf, 400_000);
    assert_eq!(report.cpus[0].delta.irq_count, 5);
    assert_eq!(report.cpus[0].metrics.package_watts, 2000.0);
}

#[test]
fn regressed_cpu_is_skipped_alone() {
    let regs = FakeRegisters::default();
    let paths = SysPaths::with_root(Path::new("/fake"));
    for cpu in 0..3 {
        set_counters(&regs, cpu, Counters { tsc: 5_000, aperf: 0, mperf: 0, instr: 0 });
    }
    let mut sampler = sampler(&regs, &paths);
    let t0 = Instant::now();
    sampler.sample_at(t0);

    set_counters(&regs, 0, Counters { tsc: 6_000, aperf: 0, mperf: 0, instr: 0 });
    set_counters(&regs, 1, Counters { tsc: 4_000, aperf: 0, mperf: 0, instr: 0 });
    set_counters(&regs, 2, Counters { tsc: 6_000, aperf: 0, mperf: 0, instr: 0 });
    let report = sampler.sample_at(t0 + Duration::from_secs(1)).expect("report");

    let reported: Vec<CpuId> = report.cpus.iter().map(|c| c.cpu_id).collect();
    assert_eq!(reported, vec![0, 2]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, Entity::Cpu(1));

    // the new snapshot set has replaced the previous one, cpu 1 is measured again from there
    set_counters(&regs, 1, Counters { tsc: 4_500, aperf: 0, mperf: 0, instr: 0 });
    let report = sampler.sample_at(t0 + Duration::from_secs(2)).expect("report");
    assert_eq!(report.cpus.len(), 3);
    assert_eq!(report.cpus[1].delta.tsc, 500);
}

#[test]
fn stale_sample_time_is_rejected() {
    let regs = FakeRegisters::default();
    let paths = SysPaths::with_root(Path::new("/fake"));
    set_counters(&regs, 0, Counters { tsc: 1, aperf: 0, mperf: 0, instr: 0 });
    let mut sampler = sampler(&regs, &paths);
    let t0 = Instant::now() + Duration::from_secs(10);
    sampler.sample_at(t0);

    // nothing changed: the zero interval is valid
    let report = sampler.sample_at(t0).expect("report");
    assert_eq!(report.cpus.len(), 3);
    assert!(report.cpus.iter().all(|c| c.metrics.busy_percent == 0.0 && c.delta.interval > 0.0));

    set_counters(&regs, 0, Counters { tsc: 2, aperf: 0, mperf: 0, instr: 0 });
    let report = sampler.sample_at(t0 - Duration::from_secs(1)).expect("report");
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.cpus.len(), 2);
}

#[test]
fn no_cpu_is_fatal() {
    let regs = FakeRegisters::default();
    let builder = SnapshotBuilder::new(&regs, topology(), SysPaths::default());
    assert!(Sampler::new(builder, BTreeSet::new(), MetricsConfig::default()).is_err());
}
