//! MetricsCollectorActor - samples host health on a fixed interval
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → HostProbe → evaluate thresholds → publish MetricsSnapshot → [FleetLink, ...]
//!     ↑
//!     └─── Commands (CollectNow, UpdateInterval, Shutdown)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, instrument, trace, warn};

use crate::{MetricsSnapshot, config::Thresholds, monitors::probe::HostProbe};

use super::messages::CollectorCommand;

pub struct MetricsCollectorActor {
    probe: Arc<dyn HostProbe>,

    thresholds: Thresholds,

    command_rx: mpsc::Receiver<CollectorCommand>,

    /// Broadcast sender for publishing snapshots
    snapshot_tx: broadcast::Sender<MetricsSnapshot>,

    interval_duration: Duration,
}

impl MetricsCollectorActor {
    pub fn new(
        probe: Arc<dyn HostProbe>,
        thresholds: Thresholds,
        interval_duration: Duration,
        command_rx: mpsc::Receiver<CollectorCommand>,
        snapshot_tx: broadcast::Sender<MetricsSnapshot>,
    ) -> Self {
        Self {
            probe,
            thresholds,
            command_rx,
            snapshot_tx,
            interval_duration,
        }
    }

    /// Runs until a Shutdown command arrives or every handle is gone
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting collector actor");

        let mut ticker = interval(self.interval_duration);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        CollectorCommand::CollectNow { respond_to } => {
                            debug!("received CollectNow command");
                            let snapshot = self.collect().await;
                            let _ = respond_to.send(snapshot);
                        }

                        CollectorCommand::UpdateInterval { interval_secs } => {
                            debug!("updating interval to {interval_secs}s");
                            self.interval_duration = Duration::from_secs(interval_secs.max(1));
                            ticker = interval(self.interval_duration);
                        }

                        CollectorCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("collector actor stopped");
    }

    /// Sample, evaluate and publish. Never fails; the probe degrades instead.
    async fn collect(&self) -> MetricsSnapshot {
        let reading = self.probe.sample().await;
        let snapshot = MetricsSnapshot::from_reading(reading, &self.thresholds);

        for alert in &snapshot.alerts {
            warn!("{:?} {:?} alert: {}", alert.level, alert.kind, alert.message);
        }

        // no receivers is fine, the link may be offline
        match self.snapshot_tx.send(snapshot.clone()) {
            Ok(receivers) => trace!("published snapshot to {receivers} receivers"),
            Err(_) => trace!("no receivers for snapshot"),
        }

        snapshot
    }
}

/// Handle for controlling a MetricsCollectorActor
#[derive(Clone)]
pub struct CollectorHandle {
    sender: mpsc::Sender<CollectorCommand>,
}

impl CollectorHandle {
    pub fn spawn(
        probe: Arc<dyn HostProbe>,
        thresholds: Thresholds,
        interval_duration: Duration,
        snapshot_tx: broadcast::Sender<MetricsSnapshot>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor =
            MetricsCollectorActor::new(probe, thresholds, interval_duration, cmd_rx, snapshot_tx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn collect_now(&self) -> Result<MetricsSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CollectorCommand::CollectNow { respond_to: tx })
            .await
            .context("failed to send CollectNow command")?;

        rx.await.context("failed to receive snapshot")
    }

    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.sender
            .send(CollectorCommand::UpdateInterval { interval_secs })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CollectorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
