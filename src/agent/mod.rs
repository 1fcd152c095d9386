use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::report::HwpcReport;
use crate::sink::Sink;
use crate::source::Source;

/// Agent wires sources, the dispatcher and sinks together.
pub struct Agent {
    channel_capacity: usize,
    sources: Vec<Source>,
    dispatcher: Dispatcher,
}

impl Agent {
    /// Creates a new Agent from a validated configuration.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().context("validating config")?;

        let sources = cfg.inputs.iter().map(Source::from_config).collect();
        let sinks = cfg.outputs.iter().map(Sink::from_config).collect();
        let dispatcher = Dispatcher::new(cfg.dispatcher.clone(), cfg.formula.clone(), sinks);

        Ok(Self {
            channel_capacity: cfg.channel_capacity,
            sources,
            dispatcher,
        })
    }

    /// Runs until every source is exhausted or `cancel` fires.
    ///
    /// Reports already queued when cancellation is requested are still
    /// dispatched, and every buffered tick is processed before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<DispatchStats> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let dispatcher = self.dispatcher;
        let dispatch_task = tokio::task::spawn_blocking(move || dispatcher.run(rx));

        let readers: Vec<(String, JoinHandle<Result<usize>>)> = self
            .sources
            .into_iter()
            .map(|source| {
                let name = source.name().to_string();
                let handle = tokio::spawn(feed(source, tx.clone(), cancel.child_token()));
                (name, handle)
            })
            .collect();
        info!(sources = readers.len(), "agent started");

        // The dispatcher stops once the last sender is dropped.
        drop(tx);

        let mut failed = 0usize;
        for (name, handle) in readers {
            match handle.await {
                Ok(Ok(sent)) => info!(source = %name, reports = sent, "source finished"),
                Ok(Err(e)) => {
                    failed += 1;
                    error!(source = %name, error = %format!("{e:#}"), "source failed");
                }
                Err(e) => {
                    failed += 1;
                    error!(source = %name, error = %e, "source task panicked");
                }
            }
        }

        let stats = dispatch_task.await.context("dispatcher task panicked")?;

        if failed > 0 {
            bail!("{failed} source(s) failed");
        }

        Ok(stats)
    }
}

/// Reads every report of `source` and forwards it to the dispatcher.
async fn feed(
    source: Source,
    tx: mpsc::Sender<HwpcReport>,
    cancel: CancellationToken,
) -> Result<usize> {
    let name = source.name().to_string();

    let reports = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Ok(0),
        read = tokio::task::spawn_blocking(move || source.read_reports()) => {
            read.context("source reader panicked")??
        }
    };
    info!(source = %name, reports = reports.len(), "source loaded");

    let mut sent = 0;
    for report in reports {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(source = %name, sent, "source cancelled");
                break;
            }

            result = tx.send(report) => {
                if result.is_err() {
                    warn!(source = %name, "dispatcher stopped, dropping remaining reports");
                    break;
                }
                sent += 1;
            }
        }
    }

    Ok(sent)
}
