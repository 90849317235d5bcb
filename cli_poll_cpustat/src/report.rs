use std::{io::Write, time::SystemTime};

use cpustat_probes::sampler::{CpuReport, IntervalReport};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::cli::OutputType;

/// Everything the writer task needs to print one interval.
#[derive(Debug)]
pub(crate) struct ReportMessage {
    pub timestamp: SystemTime,
    pub report: IntervalReport,
}

const COLUMNS_BEFORE_IDLE: [&str; 9] = [
    "Core", "CPU", "ActMHz", "Avg_MHz", "Busy%", "Bzy_MHz", "TSC_MHz", "IPC", "IRQ",
];
const COLUMNS_AFTER_IDLE: [&str; 9] = [
    "CoreTmp", "CoreThr", "PkgTmp", "MinMHz", "MaxMHz", "Governor", "EPB", "PkgWatt", "RAMWatt",
];

/// Governors are truncated to this length in the table.
const GOVERNOR_WIDTH: usize = 11;

/// Formats the interval reports, one row per cpu.
pub(crate) struct Reporter {
    output: OutputType,
    /// Names of the idle-state columns, in display order.
    idle_states: Vec<String>,
    /// Reprint the table header every N intervals, 0 = only once.
    header_interval: usize,
    printed_intervals: usize,
}

impl Reporter {
    pub fn new(output: OutputType, idle_states: Vec<String>, header_interval: usize) -> Reporter {
        Reporter {
            output,
            idle_states,
            header_interval,
            printed_intervals: 0,
        }
    }

    fn columns(&self) -> Vec<String> {
        COLUMNS_BEFORE_IDLE
            .iter()
            .map(|c| c.to_string())
            .chain(self.idle_states.iter().map(|s| format!("{s}%")))
            .chain(COLUMNS_AFTER_IDLE.iter().map(|c| c.to_string()))
            .collect()
    }

    /// Writes what must come before the first report, if anything.
    pub fn write_preamble(&self, writer: &mut dyn Write) -> anyhow::Result<()> {
        if self.output == OutputType::Csv {
            let mut header = vec!["timestamp_ms".to_owned(), "Package".to_owned()];
            header.extend(self.columns());
            writeln!(writer, "{}", header.join(";"))?;
        }
        Ok(())
    }

    pub fn write_report(&mut self, writer: &mut dyn Write, msg: &ReportMessage) -> anyhow::Result<()> {
        match self.output {
            OutputType::None => Ok(()),
            OutputType::Table => self.write_table(writer, msg),
            OutputType::Csv => self.write_csv(writer, msg),
        }
    }

    fn write_table(&mut self, writer: &mut dyn Write, msg: &ReportMessage) -> anyhow::Result<()> {
        if msg.report.cpus.is_empty() {
            return Ok(());
        }
        let columns = self.columns();
        let widths: Vec<usize> = columns.iter().map(|c| column_width(c)).collect();

        let reprint = self.header_interval > 0 && self.printed_intervals % self.header_interval == 0;
        if self.printed_intervals == 0 || reprint {
            let utc_now = OffsetDateTime::from(msg.timestamp).format(&Rfc3339)?;
            writeln!(writer, "\n--- {utc_now} ---")?;
            writeln!(writer, "{}", align(&columns, &widths))?;
        }
        for cpu in &msg.report.cpus {
            let cells = self.cells(cpu, &msg.report, "-");
            writeln!(writer, "{}", align(&cells, &widths))?;
        }
        self.printed_intervals += 1;
        Ok(())
    }

    fn write_csv(&mut self, writer: &mut dyn Write, msg: &ReportMessage) -> anyhow::Result<()> {
        let timestamp_ms = msg.timestamp.duration_since(SystemTime::UNIX_EPOCH)?.as_millis();
        for cpu in &msg.report.cpus {
            let package = cpu.package_id.map(|p| p.to_string()).unwrap_or_default();
            let cells = self.cells(cpu, &msg.report, "");
            writeln!(writer, "{timestamp_ms};{package};{}", cells.join(";"))?;
        }
        self.printed_intervals += 1;
        Ok(())
    }

    /// The values of one row, `missing` standing for the absent ones.
    fn cells(&self, cpu: &CpuReport, report: &IntervalReport, missing: &str) -> Vec<String> {
        let d = &cpu.delta;
        let m = &cpu.metrics;
        let or_missing = |value: Option<String>| value.unwrap_or_else(|| missing.to_owned());
        let package_temperature = report
            .packages
            .iter()
            .find(|p| Some(p.package_id) == cpu.package_id)
            .and_then(|p| p.delta.package_temperature.get());

        let mut cells = vec![
            or_missing(cpu.core_id.map(|c| c.to_string())),
            cpu.cpu_id.to_string(),
            or_missing(d.current_frequency_mhz.get().map(|f| format!("{f:.1}"))),
            format!("{:.1}", m.avg_mhz),
            format!("{:.2}", m.busy_percent),
            format!("{:.1}", m.bzy_mhz),
            format!("{:.1}", m.tsc_mhz),
            format!("{:.2}", m.ipc),
            d.irq_count.to_string(),
        ];
        for state in &self.idle_states {
            cells.push(or_missing(m.idle_percent.get(state).map(|p| format!("{p:.2}"))));
        }
        cells.extend([
            or_missing(d.core_temperature.get().map(|t| t.to_string())),
            or_missing(d.throttled.get().map(|t| if t { "Y" } else { "N" }.to_owned())),
            or_missing(package_temperature.map(|t| t.to_string())),
            or_missing(d.scaling_min_mhz.get().map(|f| format!("{f:.0}"))),
            or_missing(d.scaling_max_mhz.get().map(|f| format!("{f:.0}"))),
            or_missing(d.governor.value().map(|g| g.chars().take(GOVERNOR_WIDTH).collect())),
            or_missing(d.energy_perf_bias.get().map(|epb| epb.to_string())),
            format!("{:.2}", m.package_watts),
            format!("{:.2}", m.dram_watts),
        ]);
        cells
    }
}

fn column_width(column: &str) -> usize {
    match column {
        "Governor" => GOVERNOR_WIDTH,
        "IRQ" => 10,
        c => c.len().max(5),
    }
}

/// Joins the cells with tabs. The two id columns are left-aligned, the values right-aligned.
fn align(cells: &[String], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .enumerate()
        .map(|(i, (cell, &w))| if i < 2 { format!("{cell:<w$}") } else { format!("{cell:>w$}") })
        .collect::<Vec<_>>()
        .join("\t")
}
