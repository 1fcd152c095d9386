use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::formula::{Formula, FormulaConfig, FormulaError, FormulaId};
use crate::report::{HwpcReport, PowerReport};
use crate::sink::Sink;

/// Counters collected over the lifetime of a dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// HWPC reports received.
    pub reports: u64,
    /// Reports dropped because they carried no socket entry.
    pub dropped: u64,
    /// Power reports produced by the formulas.
    pub estimates: u64,
    /// Ticks that failed with a hard formula error.
    pub failed_ticks: u64,
    /// Failed sink writes and flushes.
    pub sink_errors: u64,
}

/// Routes HWPC reports to one formula per `(sensor, socket)` and pushes the
/// resulting power reports to every sink.
///
/// Formulas are created on the first report of their stream and live until
/// `shutdown`.
pub struct Dispatcher {
    name: String,
    cfg: FormulaConfig,
    /// Formulas in creation order.
    formulas: Vec<Formula>,
    routes: HashMap<(String, String), usize>,
    sinks: Vec<Sink>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(name: String, cfg: FormulaConfig, sinks: Vec<Sink>) -> Self {
        Self {
            name,
            cfg,
            formulas: Vec::new(),
            routes: HashMap::new(),
            sinks,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Identities of the formulas created so far, in creation order.
    pub fn formula_ids(&self) -> Vec<&FormulaId> {
        self.formulas.iter().map(Formula::id).collect()
    }

    /// Routes one report. A report spanning several sockets is split into
    /// one report per socket.
    pub fn dispatch(&mut self, report: HwpcReport) {
        self.stats.reports += 1;

        let sockets: Vec<String> = report.sockets().into_iter().map(str::to_string).collect();
        match sockets.as_slice() {
            [] => {
                self.stats.dropped += 1;
                warn!(
                    sensor = %report.sensor,
                    target_name = %report.target,
                    timestamp = %report.timestamp,
                    "dropping report without socket counters",
                );
            }
            [socket] => self.route(socket, report),
            _ => {
                for socket in &sockets {
                    let part = report.for_socket(socket);
                    self.route(socket, part);
                }
            }
        }
    }

    /// Processes every buffered tick of every formula, then flushes the sinks.
    pub fn shutdown(&mut self) -> DispatchStats {
        for formula in &mut self.formulas {
            for result in formula.flush() {
                publish(&mut self.sinks, &mut self.stats, formula.id(), result);
            }
        }

        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                self.stats.sink_errors += 1;
                error!(sink = sink.name(), error = %e, "failed to flush sink");
            }
        }

        info!(
            dispatcher = %self.name,
            formulas = self.formulas.len(),
            reports = self.stats.reports,
            dropped = self.stats.dropped,
            estimates = self.stats.estimates,
            failed_ticks = self.stats.failed_ticks,
            sink_errors = self.stats.sink_errors,
            "dispatcher shut down",
        );

        self.stats
    }

    /// Consumes reports until every sender is gone, then shuts down.
    ///
    /// Blocks the calling thread; run it on a blocking task.
    pub fn run(mut self, mut rx: mpsc::Receiver<HwpcReport>) -> DispatchStats {
        while let Some(report) = rx.blocking_recv() {
            self.dispatch(report);
        }
        self.shutdown()
    }

    fn route(&mut self, socket: &str, report: HwpcReport) {
        let key = (report.sensor.clone(), socket.to_string());
        let index = match self.routes.get(&key).copied() {
            Some(index) => index,
            None => {
                let id = FormulaId::new(&self.name, &key.0, &key.1);
                info!(formula = %id, "created formula");
                self.formulas.push(Formula::new(id, &self.cfg));
                let index = self.formulas.len() - 1;
                self.routes.insert(key, index);
                index
            }
        };

        // Every index in `routes` points into `formulas`.
        let formula = &mut self.formulas[index];
        let result = formula.handle(report);
        publish(&mut self.sinks, &mut self.stats, formula.id(), result);
    }
}

fn publish(
    sinks: &mut [Sink],
    stats: &mut DispatchStats,
    formula: &FormulaId,
    result: Result<Vec<PowerReport>, FormulaError>,
) {
    let reports = match result {
        Ok(reports) => reports,
        Err(e) => {
            stats.failed_ticks += 1;
            error!(formula = %formula, error = %e, "failed to process tick");
            return;
        }
    };

    if !reports.is_empty() {
        debug!(formula = %formula, count = reports.len(), "publishing power reports");
    }

    for report in &reports {
        stats.estimates += 1;
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.send(report) {
                stats.sink_errors += 1;
                error!(
                    sink = sink.name(),
                    formula = %formula,
                    error = %e,
                    "failed to send power report",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Utc};

    use crate::report::GLOBAL_TARGET;
    use crate::sink::stdout::StdoutSink;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn reports(&self) -> Vec<PowerReport> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).expect("valid timestamp")
    }

    fn dispatcher(depth: usize) -> (Dispatcher, Captured) {
        let captured = Captured::default();
        let sink = StdoutSink::with_writer("capture".to_string(), Box::new(captured.clone()));
        let cfg = FormulaConfig {
            tick_depth: depth,
            ..Default::default()
        };
        (
            Dispatcher::new("cpu".to_string(), cfg, vec![Sink::Stdout(sink)]),
            captured,
        )
    }

    fn global(ms: i64, sensor: &str, sockets: &[&str]) -> HwpcReport {
        let mut report = HwpcReport::new(at(ms), sensor, GLOBAL_TARGET);
        for socket in sockets {
            report.set_counter("rapl", socket, "0", "RAPL_ENERGY_PKG", 1 << 32);
        }
        report
    }

    fn target(ms: i64, sensor: &str, name: &str, sockets: &[&str]) -> HwpcReport {
        let mut report = HwpcReport::new(at(ms), sensor, name);
        for socket in sockets {
            report.set_counter("core", socket, "0", "CYCLES", 10);
        }
        report
    }

    #[test]
    fn test_formulas_created_lazily_per_sensor_and_socket() {
        let (mut d, _) = dispatcher(5);
        assert!(d.formula_ids().is_empty());

        d.dispatch(global(1, "node-a", &["0"]));
        d.dispatch(target(1, "node-a", "/web", &["0"]));
        d.dispatch(global(1, "node-b", &["0"]));

        let ids: Vec<String> = d.formula_ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["cpu-node-a-0", "cpu-node-b-0"]);
    }

    #[test]
    fn test_multi_socket_report_is_split() {
        let (mut d, captured) = dispatcher(5);

        d.dispatch(global(1, "node", &["0", "1"]));
        d.dispatch(target(1, "node", "/web", &["0", "1"]));
        let ids: Vec<String> = d.formula_ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["cpu-node-0", "cpu-node-1"]);

        let stats = d.shutdown();
        assert_eq!(stats.reports, 2);
        assert_eq!(stats.estimates, 4);

        let reports = captured.reports();
        let sockets: Vec<(&str, &str)> = reports
            .iter()
            .map(|r| {
                (
                    r.target.as_str(),
                    r.metadata["socket"].as_str().unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(
            sockets,
            vec![("/web", "0"), ("rapl", "0"), ("/web", "1"), ("rapl", "1")]
        );
        assert!(reports.iter().all(|r| r.power == 1.0));
    }

    #[test]
    fn test_report_without_sockets_is_dropped() {
        let (mut d, _) = dispatcher(5);
        d.dispatch(HwpcReport::new(at(1), "node", "/web"));

        assert!(d.formula_ids().is_empty());
        assert_eq!(d.stats().dropped, 1);
    }

    #[test]
    fn test_shutdown_drains_buffered_ticks() {
        let (mut d, captured) = dispatcher(5);
        for ms in 1..=3 {
            d.dispatch(global(ms, "node", &["0"]));
            d.dispatch(target(ms, "node", "/web", &["0"]));
        }
        assert!(captured.reports().is_empty());

        let stats = d.shutdown();
        assert_eq!(stats.estimates, 6);

        let timestamps: Vec<i64> = captured
            .reports()
            .iter()
            .map(|r| r.timestamp.timestamp_millis())
            .collect();
        assert_eq!(timestamps, vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_hard_error_keeps_formula_alive() {
        let (mut d, captured) = dispatcher(2);

        let mut broken = HwpcReport::new(at(1), "node", GLOBAL_TARGET);
        broken.set_counter("msr", "0", "0", "TSC", 1);
        d.dispatch(broken);
        d.dispatch(target(1, "node", "/web", &["0"]));
        // Tick 1 is released and fails on the missing energy counter.
        d.dispatch(global(2, "node", &["0"]));
        assert_eq!(d.stats().failed_ticks, 1);

        d.dispatch(target(2, "node", "/web", &["0"]));
        d.shutdown();

        assert_eq!(d.formula_ids().len(), 1);
        let reports = captured.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.timestamp == at(2)));
    }

    #[test]
    fn test_run_consumes_channel_until_closed() {
        let (d, captured) = dispatcher(5);
        let (tx, rx) = mpsc::channel(16);

        let handle = std::thread::spawn(move || d.run(rx));
        tx.blocking_send(global(1, "node", &["0"])).unwrap();
        tx.blocking_send(target(1, "node", "/web", &["0"])).unwrap();
        drop(tx);

        let stats = handle.join().unwrap();
        assert_eq!(stats.reports, 2);
        assert_eq!(stats.estimates, 2);
        assert_eq!(captured.reports().len(), 2);
    }
}
