//! Wire format of the fleet link
//!
//! Every frame is a JSON text message `{"type": "<name>", ...}` with camelCase fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MetricsSnapshot, jobs::JobUpdate, phase::Phase};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    Authenticate {
        site_id: String,
        api_key: String,
    },
    Authenticated {
        message: String,
    },
    AuthError {
        message: String,
    },
    Heartbeat {
        site_id: String,
        timestamp: DateTime<Utc>,
    },
    Metrics {
        site_id: String,
        snapshot: MetricsSnapshot,
    },
    Command(Command),
    CommandResult {
        id: String,
        status: ResultStatus,
        #[serde(default)]
        summary: Option<String>,
    },
    SetPhase {
        phase: Phase,
    },
    JobUpdate(JobUpdate),
}

impl WireMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The `type` tag, for logging without dumping payloads
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Authenticate { .. } => "authenticate",
            WireMessage::Authenticated { .. } => "authenticated",
            WireMessage::AuthError { .. } => "auth_error",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::Metrics { .. } => "metrics",
            WireMessage::Command(_) => "command",
            WireMessage::CommandResult { .. } => "command_result",
            WireMessage::SetPhase { .. } => "set_phase",
            WireMessage::JobUpdate(_) => "job_update",
        }
    }
}

/// A remote request as sent by the registry. The action stays a plain string until validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            parameters: BTreeMap::new(),
            requested_by: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Succeeded,
    Failed,
    /// Failed validation, no job was created
    Rejected,
}
