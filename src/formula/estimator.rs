//! Naive power estimation: the package energy of a tick is split evenly
//! between every target that reported during that tick.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::report::{Metadata, PowerReport, GLOBAL_TARGET, RAPL_TARGET};

use super::assembler::Tick;
use super::{FormulaConfig, FormulaError, FormulaId};

/// Formula identifier attached to every produced report.
pub const FORMULA_NAME: &str = "naive";

/// Allocation ratio of the equal-split rule.
const NAIVE_RATIO: f64 = 1.0;

/// Scale of the fixed-point energy counters: raw value × 2⁻³² = watts over
/// one accounting interval.
const ENERGY_SCALE_EXPONENT: i32 = -32;

/// Converts a raw fixed-point energy counter to watts.
pub fn raw_energy_to_watts(raw: u64) -> f64 {
    raw as f64 * 2f64.powi(ENERGY_SCALE_EXPONENT)
}

/// Equal-split estimator bound to one sensor and socket.
#[derive(Debug, Clone)]
pub struct NaiveEstimator {
    sensor: String,
    socket: String,
    scope: String,
    energy_group: String,
    energy_counter: String,
}

impl NaiveEstimator {
    pub fn new(id: &FormulaId, cfg: &FormulaConfig) -> Self {
        Self {
            sensor: id.sensor.clone(),
            socket: id.socket.clone(),
            scope: cfg.scope.clone(),
            energy_group: cfg.energy_group.clone(),
            energy_counter: cfg.energy_counter.clone(),
        }
    }

    /// Estimates the power of every target of a tick.
    ///
    /// Returns one report per target in tick order followed by the
    /// un-split [`RAPL_TARGET`] report.
    pub fn estimate(
        &self,
        timestamp: DateTime<Utc>,
        mut tick: Tick,
    ) -> Result<Vec<PowerReport>, FormulaError> {
        let global = tick
            .remove(GLOBAL_TARGET)
            .ok_or(FormulaError::MissingGlobalReport { timestamp })?;

        if tick.is_empty() {
            return Err(FormulaError::NoTargetReports { timestamp });
        }

        let raw_energy = global
            .groups
            .get(&self.energy_group)
            .and_then(|sockets| sockets.get(&self.socket))
            .and_then(|cpus| cpus.first())
            .and_then(|(_, counters)| counters.get(&self.energy_counter))
            .copied()
            .ok_or_else(|| FormulaError::MissingCounter {
                timestamp,
                group: self.energy_group.clone(),
                socket: self.socket.clone(),
                counter: self.energy_counter.clone(),
            })?;

        let energy_in_watts = raw_energy_to_watts(raw_energy);
        let power_per_target = energy_in_watts / tick.len() as f64;

        let mut reports = Vec::with_capacity(tick.len() + 1);
        for report in tick.iter() {
            reports.push(self.power_report(
                timestamp,
                &report.target,
                power_per_target,
                &report.metadata,
            ));
        }
        reports.push(self.power_report(timestamp, RAPL_TARGET, energy_in_watts, &global.metadata));

        Ok(reports)
    }

    fn power_report(
        &self,
        timestamp: DateTime<Utc>,
        target: &str,
        power: f64,
        source: &Metadata,
    ) -> PowerReport {
        let mut metadata = source.clone();
        metadata.insert("scope".to_string(), Value::from(self.scope.as_str()));
        metadata.insert("socket".to_string(), Value::from(self.socket.as_str()));
        metadata.insert("formula".to_string(), Value::from(FORMULA_NAME));
        metadata.insert("ratio".to_string(), Value::from(NAIVE_RATIO));

        PowerReport {
            timestamp,
            sensor: self.sensor.clone(),
            target: target.to_string(),
            power,
            metadata,
        }
    }
}
