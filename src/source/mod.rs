pub mod csv;
pub mod json;
pub mod parse;

use anyhow::Result;

use crate::config::InputConfig;
use crate::report::HwpcReport;

use self::csv::CsvSource;
use self::json::JsonLinesSource;

/// Source produces HWPC reports from a file-based input.
///
/// Uses enum dispatch rather than trait objects, mirroring the sink side.
#[derive(Debug, Clone)]
pub enum Source {
    Csv(CsvSource),
    JsonLines(JsonLinesSource),
}

impl Source {
    pub fn from_config(cfg: &InputConfig) -> Self {
        match cfg {
            InputConfig::Csv { name, files } => Self::Csv(CsvSource::new(name.clone(), files.clone())),
            InputConfig::JsonLines { name, path } => {
                Self::JsonLines(JsonLinesSource::new(name.clone(), path.clone()))
            }
        }
    }

    /// Returns the source name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Csv(s) => s.name(),
            Self::JsonLines(s) => s.name(),
        }
    }

    /// Reads every report of this source.
    pub fn read_reports(&self) -> Result<Vec<HwpcReport>> {
        match self {
            Self::Csv(s) => s.read_reports(),
            Self::JsonLines(s) => s.read_reports(),
        }
    }
}
