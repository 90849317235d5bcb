use std::{
    collections::{BTreeSet, HashSet},
    time::Instant,
};

use anyhow::anyhow;
use log::{debug, warn};

use crate::{
    delta::{CpuDelta, InvalidDelta, PackageDelta},
    metrics::{CpuMetrics, MetricsConfig, PackageMetrics},
    snapshot::{Entity, SnapshotBuilder, SnapshotSet},
    source::RegisterSource,
    topology::Topology,
    CoreId, CpuId, PackageId,
};

/// Result of one interval for one cpu.
#[derive(Debug, Clone)]
pub struct CpuReport {
    pub cpu_id: CpuId,
    pub core_id: Option<CoreId>,
    pub package_id: Option<PackageId>,
    pub delta: CpuDelta,
    pub metrics: CpuMetrics,
}

/// Result of one interval for one package.
#[derive(Debug, Clone)]
pub struct PackageReport {
    pub package_id: PackageId,
    pub delta: PackageDelta,
    pub metrics: PackageMetrics,
}

/// Everything that has been measured during one interval, ordered by cpu and package id.
///
/// An entity whose delta is invalid is not reported, it appears in `skipped` instead.
#[derive(Debug, Clone, Default)]
pub struct IntervalReport {
    pub cpus: Vec<CpuReport>,
    pub packages: Vec<PackageReport>,
    pub skipped: Vec<(Entity, InvalidDelta)>,
}

impl IntervalReport {
    /// Diffs two complete snapshot sets.
    pub fn diff(current: &SnapshotSet, previous: &SnapshotSet, topology: &Topology, config: &MetricsConfig) -> Self {
        let mut report = IntervalReport::default();

        for (&pkg, now) in &current.packages {
            let Some(before) = previous.packages.get(&pkg) else {
                debug!("package {pkg} has no previous snapshot");
                continue;
            };
            match now.delta(before) {
                Ok(delta) => report.packages.push(PackageReport {
                    package_id: pkg,
                    metrics: PackageMetrics::derive(&delta),
                    delta,
                }),
                Err(e) => report.skipped.push((Entity::Package(pkg), e)),
            }
        }

        for (&cpu, now) in &current.cpus {
            let Some(before) = previous.cpus.get(&cpu) else {
                debug!("cpu {cpu} has no previous snapshot");
                continue;
            };
            let delta = match now.delta(before) {
                Ok(d) => d,
                Err(e) => {
                    report.skipped.push((Entity::Cpu(cpu), e));
                    continue;
                }
            };
            let placement = topology.placement(cpu);
            let package_delta = placement
                .package
                .and_then(|pkg| report.packages.iter().find(|p| p.package_id == pkg))
                .map(|p| &p.delta);
            let metrics = CpuMetrics::derive(&delta, package_delta, config);
            report.cpus.push(CpuReport {
                cpu_id: cpu,
                core_id: placement.core,
                package_id: placement.package,
                delta,
                metrics,
            });
        }
        report
    }
}

/// Samples a fixed set of cpus, interval after interval.
///
/// The sampler owns the snapshot set of the previous pass. It is replaced as a whole after
/// each pass, so stopping between two calls never leaves a partial state behind.
pub struct Sampler<S> {
    builder: SnapshotBuilder<S>,
    cpus: BTreeSet<CpuId>,
    config: MetricsConfig,
    previous: Option<SnapshotSet>,
    /// (entity, field) whose failure has already been logged
    reported_failures: HashSet<(Entity, String)>,
}

impl<S: RegisterSource> Sampler<S> {
    pub fn new(builder: SnapshotBuilder<S>, cpus: BTreeSet<CpuId>, config: MetricsConfig) -> anyhow::Result<Self> {
        if cpus.is_empty() {
            return Err(anyhow!("no cpu to monitor"));
        }
        Ok(Sampler {
            builder,
            cpus,
            config,
            previous: None,
            reported_failures: HashSet::new(),
        })
    }

    pub fn cpus(&self) -> &BTreeSet<CpuId> {
        &self.cpus
    }

    pub fn builder(&self) -> &SnapshotBuilder<S> {
        &self.builder
    }

    /// The snapshot set of the last pass, if any.
    pub fn previous(&self) -> Option<&SnapshotSet> {
        self.previous.as_ref()
    }

    /// Runs one sampling pass now. See [`Sampler::sample_at`].
    pub fn sample(&mut self) -> Option<IntervalReport> {
        self.sample_at(Instant::now())
    }

    /// Runs one sampling pass and diffs it against the previous one.
    ///
    /// Returns `None` on the first pass, which only primes the sampler.
    pub fn sample_at(&mut self, at: Instant) -> Option<IntervalReport> {
        let current = self.builder.build_at(&self.cpus, at);
        self.log_failures(&current);

        let report = self
            .previous
            .as_ref()
            .map(|previous| IntervalReport::diff(&current, previous, self.builder.topology(), &self.config));
        if let Some(r) = &report {
            for (entity, reason) in &r.skipped {
                warn!("{entity}: skipping this interval: {reason}");
            }
        }
        self.previous = Some(current);
        report
    }

    fn log_failures(&mut self, set: &SnapshotSet) {
        for f in &set.failures {
            if self.reported_failures.insert((f.entity, f.field.clone())) {
                warn!("{}: {} unavailable: {}", f.entity, f.field, f.error);
            }
        }
    }
}
