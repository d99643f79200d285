//! Request and response bodies of the registry API
//!
//! Shared with the integration tests so both sides agree on the JSON shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    MetricsSnapshot,
    jobs::JobUpdate,
    phase::Phase,
    protocol::ResultStatus,
    registry::state::{CommandOutcome, SiteView},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    /// Connected and heard from within the staleness window
    Online,
    Offline,
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteStatus::Online => write!(f, "online"),
            SiteStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteInfo {
    pub site_id: String,
    pub status: SiteStatus,
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub latest_metrics: Option<MetricsSnapshot>,
}

impl From<&SiteView> for SiteInfo {
    fn from(view: &SiteView) -> Self {
        Self {
            site_id: view.site_id.clone(),
            status: if view.online {
                SiteStatus::Online
            } else {
                SiteStatus::Offline
            },
            connected: view.connected,
            connected_at: view.connected_at,
            last_heartbeat_at: view.last_heartbeat_at,
            latest_metrics: view.latest_metrics.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitesResponse {
    pub sites: Vec<SiteInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultInfo {
    pub id: String,
    pub status: ResultStatus,
    pub summary: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl From<CommandOutcome> for CommandResultInfo {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            id: outcome.id,
            status: outcome.status,
            summary: outcome.summary,
            received_at: outcome.received_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDetail {
    #[serde(flatten)]
    pub site: SiteInfo,
    pub last_job: Option<JobUpdate>,
    pub recent_results: Vec<CommandResultInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Reusing an id makes the request idempotent on the device
    #[serde(default)]
    pub id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAccepted {
    pub command_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRequest {
    pub phase: Phase,
}
