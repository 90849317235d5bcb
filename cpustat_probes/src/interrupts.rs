use std::collections::BTreeMap;

use regex::Regex;

use crate::{field::FieldError, CpuId};

/// Sums the interrupt counts of each cpu, over all the rows of `/proc/interrupts`.
///
/// The first line of the file names the cpu columns (`CPU0 CPU1 ...`, only online cpus).
/// Each following row starts with a label, followed by one count per cpu column,
/// and optionally by a description.
pub fn parse_interrupts(content: &str) -> Result<BTreeMap<CpuId, u64>, FieldError> {
    let cpu_regex = Regex::new(r"^CPU(\d+)$").map_err(|e| FieldError::Io(e.to_string()))?;

    let mut lines = content.lines();
    let header = lines.next().ok_or_else(|| FieldError::Parse(String::new()))?;
    let columns: Vec<CpuId> = header
        .split_whitespace()
        .filter_map(|col| cpu_regex.captures(col))
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect();
    if columns.is_empty() {
        return Err(FieldError::Parse(header.to_owned()));
    }

    let mut counts: BTreeMap<CpuId, u64> = columns.iter().map(|&cpu| (cpu, 0)).collect();
    for line in lines {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some(label) if label.ends_with(':') => (),
            _ => continue,
        }
        // Rows like "ERR:" have a single global count, the zip stops at the first non-number.
        let values = parts.map_while(|p| p.parse::<u64>().ok());
        for (cpu, value) in columns.iter().zip(values) {
            if let Some(total) = counts.get_mut(cpu) {
                *total = total.wrapping_add(value);
            }
        }
    }
    Ok(counts)
}
