//! Message types for actor communication
//!
//! Commands go to one actor over mpsc and answer through oneshot channels; status that many
//! readers care about is published on broadcast or watch channels.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    MetricsSnapshot,
    error::{PhaseError, PlaylistError},
    phase::{Phase, PhaseChange},
    playlist::RebuildReport,
};

/// Commands that can be sent to the MetricsCollectorActor
#[derive(Debug)]
pub enum CollectorCommand {
    /// Sample immediately, bypassing the interval timer. The snapshot is also published.
    CollectNow {
        respond_to: oneshot::Sender<MetricsSnapshot>,
    },

    /// Takes effect immediately; the timer restarts
    UpdateInterval { interval_secs: u64 },

    Shutdown,
}

/// Commands that can be sent to the PlaybackActor
#[derive(Debug)]
pub enum PlaybackCommand {
    SetPhase {
        phase: Phase,
        respond_to: oneshot::Sender<Result<PhaseChange, PhaseError>>,
    },

    /// Rebuild the playlist for the current phase
    Rebuild {
        respond_to: oneshot::Sender<Result<RebuildReport, PlaylistError>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<PlaybackStatus>,
    },

    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub phase: Phase,
    /// Rebuild attempts since start, successful or not
    pub rebuilds: u64,
    pub last_rebuild: Option<RebuildReport>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub enum LinkCommand {
    Shutdown,
}

/// State of the authenticated session on top of the current transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSession {
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Not (yet) authenticated. `attempt` counts failed attempts since the last session.
    Connecting {
        attempt: u32,
        last_error: Option<String>,
    },
    Online(ConnectionSession),
}

impl LinkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, LinkStatus::Online(_))
    }
}
