pub mod assembler;
pub mod estimator;

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error};

pub use crate::config::FormulaConfig;
use crate::report::{HwpcReport, PowerReport};

use self::assembler::{Tick, TickAssembler};
use self::estimator::NaiveEstimator;

/// Errors raised while turning a tick into power reports.
#[derive(Error, Debug)]
pub enum FormulaError {
    #[error("failed to process tick {timestamp}: missing global report")]
    MissingGlobalReport { timestamp: DateTime<Utc> },

    #[error("no target reports available for tick {timestamp}")]
    NoTargetReports { timestamp: DateTime<Utc> },

    #[error("tick {timestamp}: global report has no {group}/{socket}/{counter} counter")]
    MissingCounter {
        timestamp: DateTime<Utc>,
        group: String,
        socket: String,
        counter: String,
    },
}

impl FormulaError {
    /// Whether the tick is simply skipped rather than the input being malformed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MissingGlobalReport { .. } | Self::NoTargetReports { .. }
        )
    }
}

/// Identity of one formula instance: which dispatcher created it and which
/// sensor/socket stream it is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormulaId {
    pub dispatcher: String,
    pub sensor: String,
    pub socket: String,
}

impl FormulaId {
    pub fn new(dispatcher: &str, sensor: &str, socket: &str) -> Self {
        Self {
            dispatcher: dispatcher.to_string(),
            sensor: sensor.to_string(),
            socket: socket.to_string(),
        }
    }
}

impl fmt::Display for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.dispatcher, self.sensor, self.socket)
    }
}

/// One power estimation engine: reassembles ticks for a single sensor/socket
/// and estimates the power of every tick it releases.
///
/// Not meant for concurrent use; callers serialize `handle` calls.
#[derive(Debug)]
pub struct Formula {
    id: FormulaId,
    assembler: TickAssembler,
    estimator: NaiveEstimator,
}

impl Formula {
    pub fn new(id: FormulaId, cfg: &FormulaConfig) -> Self {
        Self {
            assembler: TickAssembler::new(cfg.tick_depth),
            estimator: NaiveEstimator::new(&id, cfg),
            id,
        }
    }

    pub fn id(&self) -> &FormulaId {
        &self.id
    }

    /// Number of ticks waiting for more reports.
    pub fn pending_ticks(&self) -> usize {
        self.assembler.len()
    }

    /// Buffers one report and returns the power reports of the tick it
    /// released, if any.
    pub fn handle(&mut self, report: HwpcReport) -> Result<Vec<PowerReport>, FormulaError> {
        debug!(
            formula = %self.id,
            target_name = %report.target,
            timestamp = %report.timestamp,
            "received report",
        );

        match self.assembler.ingest(report) {
            Some((timestamp, tick)) => self.process(timestamp, tick),
            None => Ok(Vec::new()),
        }
    }

    /// Processes every buffered tick, oldest first, one result per tick.
    pub fn flush(&mut self) -> Vec<Result<Vec<PowerReport>, FormulaError>> {
        self.assembler
            .drain_all()
            .into_iter()
            .map(|(timestamp, tick)| self.process(timestamp, tick))
            .collect()
    }

    fn process(
        &self,
        timestamp: DateTime<Utc>,
        tick: Tick,
    ) -> Result<Vec<PowerReport>, FormulaError> {
        debug!(formula = %self.id, %timestamp, reports = tick.len(), "processing tick");

        match self.estimator.estimate(timestamp, tick) {
            Ok(reports) => Ok(reports),
            Err(e) if e.is_recoverable() => {
                error!(formula = %self.id, error = %e, "skipping tick");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::GLOBAL_TARGET;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).expect("valid timestamp")
    }

    fn global(ms: i64, raw: u64) -> HwpcReport {
        let mut report = HwpcReport::new(at(ms), "sensor", GLOBAL_TARGET);
        report.set_counter("rapl", "0", "0", "RAPL_ENERGY_PKG", raw);
        report
    }

    fn target(ms: i64, name: &str) -> HwpcReport {
        HwpcReport::new(at(ms), "sensor", name)
    }

    fn formula() -> Formula {
        Formula::new(FormulaId::new("cpu", "sensor", "0"), &FormulaConfig::default())
    }

    #[test]
    fn test_formula_id_display() {
        let id = FormulaId::new("cpu", "node-1", "0");
        assert_eq!(id.to_string(), "cpu-node-1-0");
    }

    #[test]
    fn test_handle_emits_oldest_tick_at_depth() {
        let mut formula = formula();

        for ms in 1..=4 {
            assert!(formula.handle(global(ms, 1 << 32)).unwrap().is_empty());
            assert!(formula.handle(target(ms, "/a")).unwrap().is_empty());
            assert!(formula.handle(target(ms, "/b")).unwrap().is_empty());
        }
        assert_eq!(formula.pending_ticks(), 4);

        let reports = formula.handle(global(5, 1 << 32)).unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.timestamp == at(1)));
        assert_eq!(reports[0].power, 0.5);
        assert_eq!(reports[1].power, 0.5);
        assert_eq!(reports[2].power, 1.0);
        assert_eq!(formula.pending_ticks(), 4);
    }

    #[test]
    fn test_recoverable_diagnostics_yield_no_reports() {
        let mut formula = formula();
        // Tick 1 has no global report, tick 2 has no target report.
        formula.handle(target(1, "/a")).unwrap();
        formula.handle(global(2, 1 << 32)).unwrap();

        let results = formula.flush();
        assert_eq!(results.len(), 2);
        for result in results {
            assert!(result.expect("recoverable").is_empty());
        }
    }

    #[test]
    fn test_missing_counter_propagates() {
        let mut formula = Formula::new(
            FormulaId::new("cpu", "sensor", "0"),
            &FormulaConfig {
                tick_depth: 2,
                ..Default::default()
            },
        );

        let mut broken = HwpcReport::new(at(1), "sensor", GLOBAL_TARGET);
        broken.set_counter("msr", "0", "0", "TSC", 1);
        assert!(formula.handle(broken).unwrap().is_empty());
        assert!(formula.handle(target(1, "/a")).unwrap().is_empty());

        let err = formula.handle(global(2, 1 << 32)).unwrap_err();
        assert!(matches!(err, FormulaError::MissingCounter { .. }));

        // The failed tick is discarded, not re-buffered.
        assert_eq!(formula.pending_ticks(), 1);
    }

    #[test]
    fn test_flush_drains_everything_once() {
        let mut formula = formula();
        for ms in 1..=3 {
            formula.handle(global(ms, 2 << 32)).unwrap();
            formula.handle(target(ms, "/a")).unwrap();
        }

        let results = formula.flush();
        assert_eq!(results.len(), 3);
        for result in results {
            let reports = result.unwrap();
            assert_eq!(reports.len(), 2);
            assert_eq!(reports[0].power, 2.0);
        }
        assert!(formula.flush().is_empty());
    }
}
