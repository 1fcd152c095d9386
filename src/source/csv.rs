use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::report::HwpcReport;

use super::parse::{parse_header, parse_row};

/// Reads HWPC reports from CSV files, one file per counter group.
///
/// The group name is the file stem (`rapl.csv` holds the `rapl` group).
/// Rows of every file sharing `(timestamp, sensor, target)` merge into a
/// single report.
#[derive(Debug, Clone)]
pub struct CsvSource {
    name: String,
    files: Vec<PathBuf>,
}

impl CsvSource {
    pub fn new(name: String, files: Vec<PathBuf>) -> Self {
        Self { name, files }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads every file and returns the merged reports ordered by timestamp,
    /// then by first appearance.
    pub fn read_reports(&self) -> Result<Vec<HwpcReport>> {
        let mut reports: Vec<HwpcReport> = Vec::new();
        let mut index: HashMap<(DateTime<Utc>, String, String), usize> = HashMap::new();

        for path in &self.files {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let group = group_name(path)?;

            let rows = merge_file(&content, &group, &mut reports, &mut index)
                .with_context(|| format!("parsing {}", path.display()))?;
            debug!(source = %self.name, file = %path.display(), rows, "loaded csv file");
        }

        reports.sort_by_key(|report| report.timestamp);
        Ok(reports)
    }
}

fn group_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .with_context(|| format!("no group name in file name {}", path.display()))
}

/// Merges the rows of one file into `reports`, returning the row count.
fn merge_file(
    content: &str,
    group: &str,
    reports: &mut Vec<HwpcReport>,
    index: &mut HashMap<(DateTime<Utc>, String, String), usize>,
) -> Result<usize> {
    let mut lines = content.lines().enumerate();
    let (_, first) = lines.next().unwrap_or((0, ""));
    let header = parse_header(first).context("line 1")?;

    let mut rows = 0;
    for (number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let row = parse_row(&header, line).with_context(|| format!("line {}", number + 1))?;

        let key = (row.timestamp, row.sensor.clone(), row.target.clone());
        let pos = *index.entry(key).or_insert_with(|| {
            reports.push(HwpcReport::new(row.timestamp, &row.sensor, &row.target));
            reports.len() - 1
        });

        let report = &mut reports[pos];
        for (counter, value) in &row.counters {
            report.set_counter(group, &row.socket, &row.cpu, counter, *value);
        }
        rows += 1;
    }

    Ok(rows)
}
