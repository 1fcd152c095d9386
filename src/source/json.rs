use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::report::HwpcReport;

/// Reads HWPC reports serialized one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    name: String,
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(name: String, path: PathBuf) -> Self {
        Self { name, path }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads every report in file order. Blank lines are skipped.
    pub fn read_reports(&self) -> Result<Vec<HwpcReport>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                serde_json::from_str::<HwpcReport>(line).with_context(|| {
                    format!("parsing {} line {}", self.path.display(), number + 1)
                })
            })
            .collect()
    }
}
