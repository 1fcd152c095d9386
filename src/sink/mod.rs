pub mod csv;
pub mod stdout;

use anyhow::Result;

use crate::config::OutputConfig;
use crate::report::PowerReport;

use self::csv::CsvSink;
use self::stdout::StdoutSink;

/// Sink persists power reports produced by the formulas.
pub enum Sink {
    Csv(CsvSink),
    Stdout(StdoutSink),
}

impl Sink {
    pub fn from_config(cfg: &OutputConfig) -> Self {
        match cfg {
            OutputConfig::Csv { name, directory } => {
                Self::Csv(CsvSink::new(name.clone(), directory.clone()))
            }
            OutputConfig::Stdout { name } => Self::Stdout(StdoutSink::new(name.clone())),
        }
    }

    /// Returns the sink name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Csv(s) => s.name(),
            Self::Stdout(s) => s.name(),
        }
    }

    /// Writes a single power report.
    pub fn send(&mut self, report: &PowerReport) -> Result<()> {
        match self {
            Self::Csv(s) => s.send(report),
            Self::Stdout(s) => s.send(report),
        }
    }

    /// Flushes buffered output.
    pub fn flush(&mut self) -> Result<()> {
        match self {
            Self::Csv(s) => s.flush(),
            Self::Stdout(s) => s.flush(),
        }
    }
}
