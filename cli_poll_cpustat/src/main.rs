use anyhow::{anyhow, Context};
use clap::Parser;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use cli::{Cli, Commands, OutputType};
use cpustat_probes::{
    cpuidle::IdleStateTable,
    metrics::MetricsConfig,
    msr::{self, CpuVendor, MsrRegisters, DEFAULT_TJMAX},
    powercap::RaplDomains,
    sampler::Sampler,
    snapshot::SnapshotBuilder,
    source::read_sysfs,
    topology::{self, Topology},
    CpuId, RaplDomain, SysPaths,
};
use log::{info, warn};
use report::Reporter;

mod cli;
mod poll;
mod report;

const MEASUREMENTS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const WRITER_BUFFER_CAPACITY: usize = 8192 * 10;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();
    let paths = SysPaths::default();

    // run the command
    match cli.command {
        Commands::Info => print_info(&paths)?,
        Commands::Poll {
            interval,
            cpus,
            header_interval,
            ipc_reference,
            bzy_method,
            enable_fixed_counters,
            output,
            output_file,
            count,
        } => {
            if !(interval > 0.0 && interval.is_finite()) {
                return Err(anyhow!("Invalid interval {interval}: it must be positive"));
            }
            let polling_period = Duration::from_secs_f64(interval);
            if count == Some(0) {
                info!("Count set to zero, stopping here.");
                return Ok(());
            }

            let cpus = cpus_to_monitor(&paths, cpus.as_deref())?;
            info!("Monitoring {} CPUs: {}", cpus.len(), mkstring(&cpus.iter().collect::<Vec<_>>(), ","));

            let is_root = check_privileges();
            let topology = Topology::from_sysfs(&paths, &cpus)?;
            let idle_states = IdleStateTable::discover(&paths, &cpus);
            let rapl = RaplDomains::discover(&paths.powercap())?;
            for domain in RaplDomain::ALL {
                if rapl.zones(domain).is_empty() {
                    warn!("No {domain} RAPL domain found via powercap.");
                }
            }
            print_pstate_info(&paths);
            check_vendor(&paths);

            // the devices must be writable to program the fixed counters
            let registers = MsrRegisters::open(&cpus, enable_fixed_counters && is_root);
            if !registers.any_accessible() {
                warn!("No MSR device could be opened: the counters will be zero and the temperatures absent.");
            }
            let tjmax = tjmax_of(&registers, &topology, &cpus);

            let enabled_cpus = if enable_fixed_counters {
                if is_root {
                    msr::enable_fixed_counters(&registers, &cpus)
                } else {
                    warn!("Cannot enable the fixed counters without root. Relying on external enablement for IPC.");
                    Vec::new()
                }
            } else {
                Vec::new()
            };

            let reporter = Reporter::new(output, idle_states.state_names(), header_interval);
            let builder = SnapshotBuilder::new(registers, topology, paths.clone())
                .with_idle_states(idle_states)
                .with_rapl(rapl)
                .with_tjmax(tjmax);
            let config = MetricsConfig {
                ipc_reference,
                busy_frequency: bzy_method,
                ..Default::default()
            };
            let mut sampler = Sampler::new(builder, cpus, config)?;

            // prepare the output, if any
            let writer: Box<dyn Write + Send> = match (output, output_file) {
                (OutputType::None, _) => Box::new(std::io::sink()),
                (_, Some(filename)) => {
                    let file = File::create(&filename).with_context(|| format!("failed to create {filename}"))?;
                    Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file))
                }
                (_, None) => Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, std::io::stdout())),
            };

            let res = poll::run(
                writer,
                reporter,
                &mut sampler,
                polling_period,
                count,
                MEASUREMENTS_FLUSH_INTERVAL,
            )
            .await;

            // restore the counters even if the polling failed
            if !enabled_cpus.is_empty() {
                msr::disable_fixed_counters(sampler.builder().source(), &enabled_cpus);
            }
            res?;
        }
    }

    Ok(())
}

/// The cpus given on the command line, or the cpus this process is allowed to run on.
fn cpus_to_monitor(paths: &SysPaths, requested: Option<&str>) -> anyhow::Result<BTreeSet<CpuId>> {
    let cpus = match requested {
        Some(list) => {
            let requested = topology::parse_cpu_list(list)?;
            let online = topology::online_cpus(paths)?;
            topology::select_cpus(&requested, &online)
        }
        None => topology::effective_cpus(paths)?.into_iter().collect(),
    };
    if cpus.is_empty() {
        return Err(anyhow!("No target CPUs found or specified."));
    }
    Ok(cpus)
}

/// Warns about what will not be measurable. Returns `true` if the process runs as root.
fn check_privileges() -> bool {
    let is_root = match std::fs::metadata("/proc/self") {
        Ok(meta) => meta.uid() == 0,
        Err(e) => {
            warn!("Could not determine the user of this process: {e}");
            false
        }
    };
    if !is_root {
        warn!("Running without root privileges.");
        warn!("MSR access (needed for TSC, APERF, MPERF, temperatures, instructions retired) will fail.");
        warn!("IPC and other MSR-based stats will be unavailable or zero.");
    } else if !Path::new("/dev/cpu/0/msr").exists() {
        warn!("'msr' kernel module not loaded or /dev/cpu/0/msr not found. Load the module with `sudo modprobe msr`.");
    }
    is_root
}

/// TjMax of the first cpu that belongs to a known package.
fn tjmax_of(registers: &MsrRegisters, topology: &Topology, cpus: &BTreeSet<CpuId>) -> u32 {
    let Some(&cpu) = cpus
        .iter()
        .find(|&&cpu| topology.package_of(cpu).is_some())
        .or_else(|| cpus.first())
    else {
        return DEFAULT_TJMAX;
    };
    let tjmax = msr::read_tjmax(registers, cpu);
    info!("Using TjMax: {tjmax}°C (from CPU {cpu})");
    tjmax
}

fn check_vendor(paths: &SysPaths) {
    match msr::cpu_vendor(&paths.cpuinfo()) {
        Ok(CpuVendor::Amd) => warn!(
            "AMD cpus do not implement the Intel thermal and fixed-counter MSRs, temperatures and IPC will be absent or zero."
        ),
        Ok(CpuVendor::Intel) => (),
        // not dramatic, we can proceed
        Err(e) => warn!("Failed to detect the cpu vendor. {e:?}"),
    }
}

/// Logs the global settings of the intel_pstate driver, if it is loaded.
fn print_pstate_info(paths: &SysPaths) {
    let dir = paths.intel_pstate();
    if !dir.is_dir() {
        info!("intel_pstate sysfs directory not found.");
        return;
    }
    let read = |file: &str| read_sysfs(&dir.join(file)).unwrap_or_else(|_| "N/A".to_owned());
    info!("intel_pstate status: {}", read("status"));
    info!("intel_pstate no_turbo: {} (1=disabled, 0=enabled)", read("no_turbo"));
    info!("intel_pstate hwp_dynamic_boost: {} (1=enabled, 0=disabled)", read("hwp_dynamic_boost"));
}

fn print_info(paths: &SysPaths) -> anyhow::Result<()> {
    let online = topology::online_cpus(paths)?;
    let cpus: BTreeSet<CpuId> = topology::effective_cpus(paths)?.into_iter().collect();
    println!("Online CPUs: {}", mkstring(&online, ","));
    println!("CPUs available to this process: {}", mkstring(&cpus.iter().collect::<Vec<_>>(), ","));

    let topology = Topology::from_sysfs(paths, &cpus)?;
    println!("\nTopology:");
    for &cpu in &cpus {
        let show = |id: Option<u32>| id.map_or("?".to_owned(), |i| i.to_string());
        println!("- cpu {cpu}: core {}, package {}", show(topology.core_of(cpu)), show(topology.package_of(cpu)));
    }
    println!("\nPackages: {}", mkstring(&topology.packages(&cpus).keys().collect::<Vec<_>>(), ", "));

    let idle_states = IdleStateTable::discover(paths, &cpus);
    println!("\nIdle states: {}", mkstring(&idle_states.state_names(), ", "));

    let rapl = RaplDomains::discover(&paths.powercap())?;
    println!("\nFound powercap zones:");
    for domain in RaplDomain::ALL {
        for zone in rapl.zones(domain) {
            println!("{zone}");
        }
    }

    println!();
    print_pstate_info(paths);

    let registers = MsrRegisters::open(&cpus, false);
    if registers.any_accessible() {
        tjmax_of(&registers, &topology, &cpus);
    } else {
        info!("MSR devices not accessible, TjMax unknown (default {DEFAULT_TJMAX}°C).");
    }
    match msr::cpu_vendor(&paths.cpuinfo()) {
        Ok(vendor) => println!("CPU vendor: {vendor:?}"),
        Err(e) => warn!("Failed to detect the cpu vendor. {e:?}"),
    }
    Ok(())
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}
