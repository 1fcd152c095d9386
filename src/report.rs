use std::collections::BTreeMap;
use std::fmt;
use std::ops::Index;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Target name of the machine-wide report carrying the energy counters.
pub const GLOBAL_TARGET: &str = "all";

/// Target name of the un-split baseline power estimation.
pub const RAPL_TARGET: &str = "rapl";

/// Free-form key/value pairs propagated from input to output reports.
pub type Metadata = serde_json::Map<String, Value>;

/// Raw counter values keyed by counter name (e.g. `RAPL_ENERGY_PKG`).
pub type Counters = BTreeMap<String, u64>;

/// Counter group contents: socket id -> cpu id -> counters.
pub type SocketCounters = BTreeMap<String, CpuCounters>;

/// Counters of every cpu of one socket, in the order the cpus were first
/// reported.
///
/// The energy counter is read from the first cpu entry, so row order of the
/// input files and key order of JSON objects are preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuCounters {
    entries: Vec<(String, Counters)>,
}

impl CpuCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cpu: &str) -> Option<&Counters> {
        self.entries
            .iter()
            .find(|(id, _)| id == cpu)
            .map(|(_, counters)| counters)
    }

    /// Returns the counters of `cpu`, appending an empty entry if needed.
    pub fn entry(&mut self, cpu: &str) -> &mut Counters {
        let pos = match self.entries.iter().position(|(id, _)| id == cpu) {
            Some(pos) => pos,
            None => {
                self.entries.push((cpu.to_string(), Counters::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos].1
    }

    /// First reported cpu and its counters.
    pub fn first(&self) -> Option<(&str, &Counters)> {
        self.entries
            .first()
            .map(|(id, counters)| (id.as_str(), counters))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Counters)> {
        self.entries
            .iter()
            .map(|(id, counters)| (id.as_str(), counters))
    }
}

impl Index<&str> for CpuCounters {
    type Output = Counters;

    fn index(&self, cpu: &str) -> &Counters {
        match self.get(cpu) {
            Some(counters) => counters,
            None => panic!("no counters for cpu {cpu:?}"),
        }
    }
}

impl Serialize for CpuCounters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(id, counters)| (id, counters)))
    }
}

impl<'de> Deserialize<'de> for CpuCounters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CpuCountersVisitor;

        impl<'de> Visitor<'de> for CpuCountersVisitor {
            type Value = CpuCounters;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of cpu id to counters")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<CpuCounters, A::Error> {
                let mut cpus = CpuCounters::new();
                while let Some((cpu, counters)) = map.next_entry::<String, Counters>()? {
                    *cpus.entry(&cpu) = counters;
                }
                Ok(cpus)
            }
        }

        deserializer.deserialize_map(CpuCountersVisitor)
    }
}

/// Hardware performance counter report emitted by a sensor for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HwpcReport {
    /// Logical sample time shared by every report of the same tick.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Sensor (monitored host) that produced the report.
    pub sensor: String,
    /// Monitored entity, or [`GLOBAL_TARGET`] for the machine-wide report.
    pub target: String,
    /// Group name -> socket -> cpu -> counter -> raw value.
    #[serde(default)]
    pub groups: BTreeMap<String, SocketCounters>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl HwpcReport {
    /// Creates a report without any counter group.
    pub fn new(timestamp: DateTime<Utc>, sensor: &str, target: &str) -> Self {
        Self {
            timestamp,
            sensor: sensor.to_string(),
            target: target.to_string(),
            groups: BTreeMap::new(),
            metadata: Metadata::new(),
        }
    }

    /// Sets a single raw counter, creating intermediate levels as needed.
    pub fn set_counter(&mut self, group: &str, socket: &str, cpu: &str, counter: &str, value: u64) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .entry(socket.to_string())
            .or_default()
            .entry(cpu)
            .insert(counter.to_string(), value);
    }

    /// Returns every socket id referenced by any counter group, sorted.
    pub fn sockets(&self) -> Vec<&str> {
        let mut sockets: Vec<&str> = self
            .groups
            .values()
            .flat_map(|group| group.keys().map(String::as_str))
            .collect();
        sockets.sort_unstable();
        sockets.dedup();
        sockets
    }

    /// Returns a copy of this report whose groups only keep `socket`.
    ///
    /// Groups without an entry for `socket` are dropped entirely.
    pub fn for_socket(&self, socket: &str) -> Self {
        let groups = self
            .groups
            .iter()
            .filter_map(|(name, sockets)| {
                sockets.get(socket).map(|cpus| {
                    let mut filtered = SocketCounters::new();
                    filtered.insert(socket.to_string(), cpus.clone());
                    (name.clone(), filtered)
                })
            })
            .collect();

        Self {
            timestamp: self.timestamp,
            sensor: self.sensor.clone(),
            target: self.target.clone(),
            groups,
            metadata: self.metadata.clone(),
        }
    }
}

/// Power estimation for one target at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReport {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub sensor: String,
    pub target: String,
    /// Estimated power in watts.
    pub power: f64,
    #[serde(default)]
    pub metadata: Metadata,
}
