use clap::{Parser, Subcommand, ValueEnum};
use cpustat_probes::metrics::{BusyFrequency, IpcReference};

#[derive(Parser)]
#[command(author, version, about = "Per-cpu activity, frequency, temperature and power, from MSRs and sysfs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about the cpus, their idle states and RAPL zones, then exit.
    Info,

    /// Measure the cpus continuously
    Poll {
        /// Measurement interval, in seconds.
        #[arg(short, long, default_value_t = 5.0)]
        interval: f64,

        /// The cpus to monitor, as a cpu list (e.g. 0,2,4-7). Defaults to the cpus this process may run on.
        #[arg(short, long)]
        cpus: Option<String>,

        /// Reprint the table header every N intervals, 0 to print it only once.
        #[arg(short = 'N', long, default_value_t = 22)]
        header_interval: usize,

        /// Counter of the core cycles used to compute the IPC.
        #[arg(long, value_enum, default_value_t = IpcReference::Aperf)]
        ipc_reference: IpcReference,

        /// How to compute the frequency while the cpu is busy.
        #[arg(long, value_enum, default_value_t = BusyFrequency::BusyFraction)]
        bzy_method: BusyFrequency,

        /// Enable the fixed-function counters (instructions, cycles) during the measurement. Requires root.
        #[arg(long)]
        enable_fixed_counters: bool,

        /// How to print the measurements.
        #[arg(short, long, value_enum, default_value_t = OutputType::Table)]
        output: OutputType,

        /// Writes the measurements to this file instead of stdout.
        #[arg(long)]
        output_file: Option<String>,

        /// Stop after this number of intervals.
        #[arg(long)]
        count: Option<usize>,
    },
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum OutputType {
    None,
    Table,
    Csv,
}
