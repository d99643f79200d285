//! PlaybackActor - single owner of the phase state machine
//!
//! Rebuilds the playlist once on start, on every phase change and whenever the content
//! file changes. Rebuilds run one at a time inside the actor, so the last one wins.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::PlaylistError,
    phase::{Phase, PhaseChange, PhaseMachine},
    playlist::RebuildReport,
};

use super::messages::{PlaybackCommand, PlaybackStatus};

pub struct PlaybackActor {
    machine: PhaseMachine,
    command_rx: mpsc::Receiver<PlaybackCommand>,
    watch_interval: Duration,
    last_rebuild: Option<RebuildReport>,
    last_error: Option<String>,
}

impl PlaybackActor {
    pub fn new(
        machine: PhaseMachine,
        watch_interval: Duration,
        command_rx: mpsc::Receiver<PlaybackCommand>,
    ) -> Self {
        Self {
            machine,
            command_rx,
            watch_interval,
            last_rebuild: None,
            last_error: None,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting playback actor in phase {}", self.machine.current());
        let _ = self.rebuild();

        let mut watch = interval_at(Instant::now() + self.watch_interval, self.watch_interval);

        loop {
            tokio::select! {
                _ = watch.tick() => {
                    if self.machine.content_changed() {
                        info!("content configuration changed, rebuilding");
                        let _ = self.rebuild();
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        PlaybackCommand::SetPhase { phase, respond_to } => {
                            let result = self.machine.set_phase(phase);
                            match &result {
                                Ok(PhaseChange::Changed(report)) => self.record(Ok(report.clone())),
                                Ok(PhaseChange::Unchanged) => {}
                                Err(e) => {
                                    error!("phase change to {phase} incomplete: {e}");
                                    self.last_error = Some(e.to_string());
                                }
                            }
                            let _ = respond_to.send(result);
                        }

                        PlaybackCommand::Rebuild { respond_to } => {
                            let _ = respond_to.send(self.rebuild());
                        }

                        PlaybackCommand::GetStatus { respond_to } => {
                            let _ = respond_to.send(self.status());
                        }

                        PlaybackCommand::Shutdown => {
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

        debug!("playback actor stopped");
    }

    fn rebuild(&mut self) -> Result<RebuildReport, PlaylistError> {
        let result = self.machine.rebuild();
        self.record(result.as_ref().cloned().map_err(ToString::to_string));
        result
    }

    fn record(&mut self, result: Result<RebuildReport, String>) {
        match result {
            Ok(report) => {
                self.last_rebuild = Some(report);
                self.last_error = None;
            }
            Err(e) => {
                error!("playlist rebuild failed, keeping previous playlist: {e}");
                self.last_error = Some(e);
            }
        }
    }

    fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            phase: self.machine.current(),
            rebuilds: self.machine.rebuilds(),
            last_rebuild: self.last_rebuild.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Handle for controlling a PlaybackActor
#[derive(Clone)]
pub struct PlaybackHandle {
    sender: mpsc::Sender<PlaybackCommand>,
}

impl PlaybackHandle {
    pub fn spawn(machine: PhaseMachine, watch_interval: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = PlaybackActor::new(machine, watch_interval, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn set_phase(&self, phase: Phase) -> Result<PhaseChange> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PlaybackCommand::SetPhase {
                phase,
                respond_to: tx,
            })
            .await
            .context("failed to send SetPhase command")?;

        Ok(rx.await.context("failed to receive response")??)
    }

    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PlaybackCommand::Rebuild { respond_to: tx })
            .await
            .context("failed to send Rebuild command")?;

        Ok(rx.await.context("failed to receive response")??)
    }

    pub async fn status(&self) -> Result<PlaybackStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PlaybackCommand::GetStatus { respond_to: tx })
            .await
            .context("failed to send GetStatus command")?;

        rx.await.context("failed to receive status")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PlaybackCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
