//! FleetLink - the device side of the registry connection
//!
//! ## Message Flow
//!
//! ```text
//! connect → authenticate ──(authenticated)──→ online ─┬─ heartbeat every interval
//!    ↑            │                                    ├─ MetricsSnapshot  → metrics
//!    │      auth_error / timeout                       ├─ JobUpdate        → job_update (+ command_result)
//!    │            ↓                                    ├─ command          → CommandExecutor
//!    └──── backoff ←──────── transport error / close ──┴─ set_phase        → PlaybackActor
//! ```
//!
//! Every heartbeat tick also sends a ping. A session that sees no inbound frame for
//! three heartbeat intervals is treated as dead and reconnected.
//!
//! The executor subscription outlives single connections: job updates produced while
//! offline wait in it and are sent after the next successful handshake.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, interval};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    MetricsSnapshot,
    backoff::Backoff,
    config::LinkConfig,
    error::LinkError,
    executor::{CommandExecutor, Subscription},
    identity::DeviceIdentity,
    jobs::{JobStatus, JobUpdate},
    protocol::{ResultStatus, WireMessage},
};

use super::{
    messages::{ConnectionSession, LinkCommand, LinkStatus},
    playback::PlaybackHandle,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Undelivered results kept across reconnects; oldest are dropped beyond this
const MAX_PENDING: usize = 512;

enum SessionEnd {
    Shutdown,
    Closed,
}

pub struct FleetLink {
    config: LinkConfig,

    executor: CommandExecutor,

    playback: Option<PlaybackHandle>,

    /// `None` once the collector is gone
    snapshots: Option<broadcast::Receiver<MetricsSnapshot>>,

    updates: Subscription,

    /// Outbound messages that could not be delivered yet
    pending: VecDeque<WireMessage>,

    command_rx: mpsc::Receiver<LinkCommand>,

    status_tx: watch::Sender<LinkStatus>,

    backoff: Backoff,
}

impl FleetLink {
    pub fn new(
        config: LinkConfig,
        executor: CommandExecutor,
        playback: Option<PlaybackHandle>,
        snapshots: broadcast::Receiver<MetricsSnapshot>,
        command_rx: mpsc::Receiver<LinkCommand>,
        status_tx: watch::Sender<LinkStatus>,
    ) -> Self {
        Self {
            backoff: Backoff::new(config.backoff),
            updates: executor.subscribe(),
            config,
            executor,
            playback,
            snapshots: Some(snapshots),
            pending: VecDeque::new(),
            command_rx,
            status_tx,
        }
    }

    #[instrument(skip(self), fields(url = %self.config.url))]
    pub async fn run(mut self) {
        debug!("starting fleet link");

        loop {
            let last_error = match self.session().await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    info!("registry closed the connection");
                    String::from("connection closed by registry")
                }
                Err(e) => {
                    warn!("link attempt failed: {e}");
                    e.to_string()
                }
            };

            let delay = self.backoff.next_delay();
            self.status_tx.send_replace(LinkStatus::Connecting {
                attempt: self.backoff.attempt(),
                last_error: Some(last_error),
            });
            debug!("reconnecting in {delay:?}");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = self.command_rx.recv() => match cmd {
                    Some(LinkCommand::Shutdown) => break,
                    None => {
                        warn!("command channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        debug!("fleet link stopped");
    }

    /// One transport connection, from connect to close
    async fn session(&mut self) -> Result<SessionEnd, LinkError> {
        // re-read every attempt so fixed credentials apply without a restart
        let identity = DeviceIdentity::load(&self.config.identity_file)?;

        let connect_timeout = self.config.connect_timeout();
        let (socket, _) = tokio::time::timeout(
            connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        )
        .await
        .map_err(|_| LinkError::ConnectTimeout {
            timeout_secs: connect_timeout.as_secs(),
        })??;
        let (mut sink, mut stream) = socket.split();
        trace!("transport connected, authenticating as {}", identity.site_id);

        let authenticate = WireMessage::Authenticate {
            site_id: identity.site_id.clone(),
            api_key: identity.api_key.clone(),
        };
        send(&mut sink, &authenticate).await?;

        let auth_timeout = self.config.auth_timeout();
        let reply = tokio::time::timeout(auth_timeout, next_message(&mut stream))
            .await
            .map_err(|_| LinkError::HandshakeTimeout {
                timeout_secs: auth_timeout.as_secs(),
            })??;

        match reply {
            WireMessage::Authenticated { message } => {
                info!("authenticated as {}: {message}", identity.site_id);
            }
            WireMessage::AuthError { message } => {
                let _ = sink.close().await;
                return Err(LinkError::Authentication(message));
            }
            other => {
                let _ = sink.close().await;
                return Err(LinkError::Protocol(format!(
                    "expected handshake reply, got {}",
                    other.kind()
                )));
            }
        }

        self.backoff.reset();
        let mut session = ConnectionSession {
            authenticated: true,
            connected_at: Utc::now(),
            last_heartbeat_at: None,
        };
        self.status_tx
            .send_replace(LinkStatus::Online(session.clone()));

        self.flush_pending(&mut sink).await?;

        let mut heartbeat = interval(self.config.heartbeat_interval());
        let idle_timeout = self.config.idle_timeout();
        // any frame counts, pongs included
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let idle = last_inbound.elapsed();
                    if idle > idle_timeout {
                        return Err(LinkError::Unresponsive {
                            idle_secs: idle.as_secs(),
                        });
                    }
                    sink.send(Message::Ping(Vec::new())).await?;

                    let now = Utc::now();
                    // heartbeats are not retried
                    send(&mut sink, &WireMessage::Heartbeat {
                        site_id: identity.site_id.clone(),
                        timestamp: now,
                    }).await?;
                    session.last_heartbeat_at = Some(now);
                    self.status_tx.send_replace(LinkStatus::Online(session.clone()));
                }

                snapshot = next_snapshot(&mut self.snapshots) => match snapshot {
                    Ok(snapshot) => {
                        send(&mut sink, &WireMessage::Metrics {
                            site_id: identity.site_id.clone(),
                            snapshot,
                        }).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("skipped {skipped} metrics snapshots");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("metrics collector gone");
                        self.snapshots = None;
                    }
                },

                update = self.updates.recv() => {
                    if let Some(update) = update {
                        self.pending.extend(outbound_for(update));
                        self.flush_pending(&mut sink).await?;
                    }
                }

                frame = stream.next() => {
                    last_inbound = Instant::now();
                    match frame {
                        None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Closed),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text, &mut sink).await?,
                        Some(Ok(_)) => {}
                    }
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(LinkCommand::Shutdown) | None => {
                        debug!("shutting down session");
                        let _ = sink.close().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                },
            }
        }
    }

    async fn flush_pending(
        &mut self,
        sink: &mut SplitSink<Socket, Message>,
    ) -> Result<(), LinkError> {
        while self.pending.len() > MAX_PENDING {
            if let Some(dropped) = self.pending.pop_front() {
                warn!("dropping undelivered {}", dropped.kind());
            }
        }

        while let Some(message) = self.pending.pop_front() {
            if let Err(e) = send(sink, &message).await {
                self.pending.push_front(message);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn handle_inbound(
        &mut self,
        text: &str,
        sink: &mut SplitSink<Socket, Message>,
    ) -> Result<(), LinkError> {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("ignoring undecodable frame: {e}");
                return Ok(());
            }
        };
        trace!("received {}", message.kind());

        match message {
            WireMessage::Command(command) => match self.executor.submit(&command) {
                Ok(submission) if submission.duplicate => {
                    debug!("command {} redelivered", command.id);
                    if let Some(result) = command_result(&submission.job.update()) {
                        self.pending.push_back(result);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("rejected command {}: {e}", command.id);
                    self.pending.push_back(WireMessage::CommandResult {
                        id: command.id,
                        status: ResultStatus::Rejected,
                        summary: Some(e.to_string()),
                    });
                }
            },

            WireMessage::SetPhase { phase } => match &self.playback {
                Some(playback) => {
                    if let Err(e) = playback.set_phase(phase).await {
                        error!("failed to apply phase {phase}: {e:#}");
                    }
                }
                None => warn!("ignoring phase {phase}, playback is disabled"),
            },

            other => warn!("unexpected {} from registry", other.kind()),
        }

        self.flush_pending(sink).await
    }
}

async fn send(
    sink: &mut SplitSink<Socket, Message>,
    message: &WireMessage,
) -> Result<(), LinkError> {
    let text = message
        .encode()
        .map_err(|e| LinkError::Protocol(format!("failed to encode {}: {e}", message.kind())))?;
    trace!("sending {}", message.kind());
    sink.send(Message::Text(text)).await?;
    Ok(())
}

async fn next_message(stream: &mut SplitStream<Socket>) -> Result<WireMessage, LinkError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => {
                return WireMessage::decode(&text)
                    .map_err(|e| LinkError::Protocol(format!("undecodable frame: {e}")));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(LinkError::Protocol(String::from(
        "connection closed during handshake",
    )))
}

async fn next_snapshot(
    snapshots: &mut Option<broadcast::Receiver<MetricsSnapshot>>,
) -> Result<MetricsSnapshot, broadcast::error::RecvError> {
    match snapshots {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn command_result(update: &JobUpdate) -> Option<WireMessage> {
    let status = match update.status {
        JobStatus::Succeeded => ResultStatus::Succeeded,
        JobStatus::Failed => ResultStatus::Failed,
        JobStatus::Queued | JobStatus::Running => return None,
    };
    Some(WireMessage::CommandResult {
        id: update.command_id.clone(),
        status,
        summary: update.summary.clone(),
    })
}

fn outbound_for(update: JobUpdate) -> Vec<WireMessage> {
    let result = command_result(&update);
    std::iter::once(WireMessage::JobUpdate(update))
        .chain(result)
        .collect()
}

/// Handle for controlling a FleetLink
#[derive(Clone)]
pub struct FleetLinkHandle {
    sender: mpsc::Sender<LinkCommand>,
    status: watch::Receiver<LinkStatus>,
}

impl FleetLinkHandle {
    pub fn spawn(
        config: LinkConfig,
        executor: CommandExecutor,
        playback: Option<PlaybackHandle>,
        snapshots: broadcast::Receiver<MetricsSnapshot>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting {
            attempt: 0,
            last_error: None,
        });

        let link = FleetLink::new(config, executor, playback, snapshots, cmd_rx, status_tx);
        tokio::spawn(link.run());

        Self {
            sender: cmd_tx,
            status: status_rx,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Watch receiver for status changes
    pub fn status_receiver(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Wait until the link is authenticated, or fail after `timeout`.
    pub async fn wait_online(&self, timeout: Duration) -> Result<ConnectionSession> {
        let mut status = self.status.clone();
        let online = tokio::time::timeout(timeout, status.wait_for(LinkStatus::is_online))
            .await
            .context("link did not come online in time")?
            .context("fleet link stopped")?;

        match &*online {
            LinkStatus::Online(session) => Ok(session.clone()),
            LinkStatus::Connecting { .. } => anyhow::bail!("link is not online"),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LinkCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
