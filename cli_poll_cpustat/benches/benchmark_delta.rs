use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cpustat_probes::{
    field::{Field, FieldError},
    metrics::MetricsConfig,
    sampler::IntervalReport,
    snapshot::{CpuSnapshot, EnergyReading, PackageSnapshot, SnapshotSet},
    topology::{Placement, Topology},
    RaplDomain,
};

const CPUS_PER_PACKAGE: u32 = 32;

/// A synthetic pass over `n_cpus` cpus, two threads per core, taken at `t`.
fn snapshot_set(n_cpus: u32, t: Instant, step: u64) -> SnapshotSet {
    let idle_states = |step: u64| {
        ["POLL", "C1", "C1E", "C6"]
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), step * 1000 * i as u64))
            .collect::<BTreeMap<_, _>>()
    };
    let cpus = (0..n_cpus)
        .map(|cpu| {
            let snapshot = CpuSnapshot {
                cpu_id: cpu,
                sample_time: t,
                tsc: step * 3_000_000_000,
                aperf: step * 1_000_000_000,
                mperf: step * 1_500_000_000,
                instructions_retired: step * 2_000_000_000,
                core_cycles: step * 1_000_000_000,
                irq_count: step * 1000,
                idle_state_time: idle_states(step),
                unread_counters: Default::default(),
                core_temperature: Field::Present(50),
                throttled: Field::Present(false),
                current_frequency_mhz: Field::Present(2400.0),
                governor: Field::Present("performance".to_owned()),
                energy_perf_bias: Field::Absent(FieldError::NotFound),
                scaling_min_mhz: Field::Present(800.0),
                scaling_max_mhz: Field::Present(4000.0),
            };
            (cpu, snapshot)
        })
        .collect();
    let packages = (0..n_cpus.div_ceil(CPUS_PER_PACKAGE))
        .map(|pkg| {
            let mut snapshot = PackageSnapshot {
                package_id: pkg,
                sample_time: t,
                package_temperature: Field::Present(55),
                energy: Default::default(),
            };
            snapshot.energy[RaplDomain::Package] = Some(EnergyReading {
                energy_uj: step * 50_000_000,
                max_energy_uj: Field::Present(262_143_328_850),
            });
            (pkg, snapshot)
        })
        .collect();
    SnapshotSet {
        sample_time: t,
        cpus,
        packages,
        failures: Vec::new(),
    }
}

fn topology(n_cpus: u32) -> Topology {
    Topology::from_placements((0..n_cpus).map(|cpu| {
        let placement = Placement {
            core: Some((cpu % CPUS_PER_PACKAGE) / 2),
            package: Some(cpu / CPUS_PER_PACKAGE),
        };
        (cpu, placement)
    }))
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval");
    let config = MetricsConfig::default();

    for n_cpus in [1, 8, 64, 256] {
        let t0 = Instant::now();
        let previous = snapshot_set(n_cpus, t0, 1);
        let current = snapshot_set(n_cpus, t0 + Duration::from_secs(1), 2);
        let topo = topology(n_cpus);

        group.bench_with_input(BenchmarkId::new("diff", n_cpus), &n_cpus, |b, _| {
            b.iter(|| IntervalReport::diff(black_box(&current), black_box(&previous), &topo, &config))
        });
    }
    group.finish();

    // done on every pass by the snapshot builder
    let cpus: BTreeSet<u32> = (0..256).collect();
    let topo = topology(256);
    c.bench_function("topology cores 256", |b| b.iter(|| topo.cores(black_box(&cpus))));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
