use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::report::PowerReport;

/// File name of every per-target power report file.
const FILE_NAME: &str = "PowerReport.csv";

/// Columns written before the metadata columns.
const FIXED_COLUMNS: [&str; 4] = ["timestamp", "sensor", "target", "power"];

struct TargetFile {
    writer: BufWriter<File>,
    /// Metadata keys, fixed by the first report written to the file.
    metadata_columns: Vec<String>,
}

/// Writes power reports as CSV, one file per sensor/target pair under
/// `<directory>/<sensor>-<target>/PowerReport.csv`.
pub struct CsvSink {
    name: String,
    directory: PathBuf,
    files: HashMap<PathBuf, TargetFile>,
}

impl CsvSink {
    pub fn new(name: String, directory: PathBuf) -> Self {
        Self {
            name,
            directory,
            files: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the file holding the reports of `sensor`/`target`.
    ///
    /// Targets are cgroup-like paths, so a target such as `/system/app`
    /// nests under the `<sensor>-` directory. Empty and `.` segments are
    /// skipped and `..` is written as `%2E%2E`, so the file always stays
    /// inside the sink directory.
    pub fn report_path(&self, sensor: &str, target: &str) -> PathBuf {
        let name = format!("{sensor}-{target}");
        let mut path = self.directory.clone();
        for segment in name.split(std::path::is_separator) {
            match segment {
                "" | "." => {}
                ".." => path.push("%2E%2E"),
                other => path.push(other),
            }
        }
        path.join(FILE_NAME)
    }

    pub fn send(&mut self, report: &PowerReport) -> Result<()> {
        let path = self.report_path(&report.sensor, &report.target);

        let file = match self.files.entry(path.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(open_target_file(&path, report)?),
        };

        let mut fields = vec![
            report.timestamp.timestamp_millis().to_string(),
            escape(&report.sensor),
            escape(&report.target),
            report.power.to_string(),
        ];
        fields.extend(file.metadata_columns.iter().map(|key| {
            report
                .metadata
                .get(key)
                .map(format_value)
                .unwrap_or_default()
        }));

        writeln!(file.writer, "{}", fields.join(","))
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn flush(&mut self) -> Result<()> {
        for (path, file) in &mut self.files {
            file.writer
                .flush()
                .with_context(|| format!("flushing {}", path.display()))?;
        }
        Ok(())
    }
}

fn open_target_file(path: &Path, first: &PowerReport) -> Result<TargetFile> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let metadata_columns: Vec<String> = first.metadata.keys().cloned().collect();
    let header: Vec<String> = FIXED_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(metadata_columns.iter().map(|c| escape(c)))
        .collect();
    writeln!(writer, "{}", header.join(","))
        .with_context(|| format!("writing header of {}", path.display()))?;

    Ok(TargetFile {
        writer,
        metadata_columns,
    })
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => escape(s),
        Value::Null => String::new(),
        other => escape(&other.to_string()),
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
