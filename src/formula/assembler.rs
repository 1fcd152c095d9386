use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::report::HwpcReport;

/// Number of buffered timestamps that triggers processing of the oldest one.
pub const DEFAULT_TICK_DEPTH: usize = 5;

/// Every report received for one timestamp, keyed by target.
///
/// Targets iterate in first-insertion order. Replacing a target keeps its
/// original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tick {
    reports: Vec<HwpcReport>,
    index: HashMap<String, usize>,
}

impl Tick {
    /// Inserts a report, returning the one it replaced for the same target.
    pub fn insert(&mut self, report: HwpcReport) -> Option<HwpcReport> {
        if let Some(&pos) = self.index.get(&report.target) {
            return self
                .reports
                .get_mut(pos)
                .map(|slot| std::mem::replace(slot, report));
        }
        self.index.insert(report.target.clone(), self.reports.len());
        self.reports.push(report);
        None
    }

    /// Removes and returns the report of `target`.
    pub fn remove(&mut self, target: &str) -> Option<HwpcReport> {
        let pos = self.index.remove(target)?;
        let report = self.reports.remove(pos);
        for other in self.index.values_mut() {
            if *other > pos {
                *other -= 1;
            }
        }
        Some(report)
    }

    pub fn get(&self, target: &str) -> Option<&HwpcReport> {
        self.index.get(target).and_then(|&pos| self.reports.get(pos))
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Iterates reports in target insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &HwpcReport> {
        self.reports.iter()
    }
}

/// Ordered buffer of in-flight ticks.
///
/// Reports for one timestamp can arrive late and out of order across
/// targets. The assembler keeps up to `depth - 1` timestamps pending and
/// releases the oldest first-seen timestamp once `depth` are buffered.
/// "Oldest" is arrival order of the first report of each timestamp, not the
/// numeric timestamp order.
#[derive(Debug)]
pub struct TickAssembler {
    depth: usize,
    /// First-seen order of buffered timestamps.
    order: VecDeque<DateTime<Utc>>,
    ticks: HashMap<DateTime<Utc>, Tick>,
}

impl TickAssembler {
    /// Creates an assembler that releases a tick once `depth` timestamps
    /// are buffered. A depth of zero behaves as one.
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            order: VecDeque::with_capacity(depth),
            ticks: HashMap::with_capacity(depth),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of distinct buffered timestamps.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Buffers a report and returns the oldest tick once the buffer is deep
    /// enough.
    pub fn ingest(&mut self, report: HwpcReport) -> Option<(DateTime<Utc>, Tick)> {
        let timestamp = report.timestamp;
        let tick = self.ticks.entry(timestamp).or_insert_with(|| {
            self.order.push_back(timestamp);
            Tick::default()
        });

        if tick.get(&report.target).is_some() {
            warn!(
                target_name = %report.target,
                timestamp = %timestamp,
                "duplicate report for target, keeping the latest",
            );
        }
        tick.insert(report);

        if self.order.len() >= self.depth {
            return self.pop_oldest();
        }
        None
    }

    /// Evicts every buffered tick, oldest first.
    pub fn drain_all(&mut self) -> Vec<(DateTime<Utc>, Tick)> {
        let mut drained = Vec::with_capacity(self.order.len());
        while let Some(entry) = self.pop_oldest() {
            drained.push(entry);
        }
        drained
    }

    fn pop_oldest(&mut self) -> Option<(DateTime<Utc>, Tick)> {
        let timestamp = self.order.pop_front()?;
        let tick = self.ticks.remove(&timestamp).unwrap_or_default();
        Some((timestamp, tick))
    }
}
