pub mod actions;
pub mod actors;
pub mod alerts;
pub mod backoff;
pub mod config;
pub mod content;
pub mod error;
pub mod executor;
pub mod identity;
pub mod jobs;
pub mod monitors;
pub mod phase;
pub mod playlist;
pub mod protocol;
#[cfg(feature = "registry")]
pub mod registry;
pub mod transcode;
pub mod util;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{alerts::evaluate, config::Thresholds, monitors::probe::HostReading};

/// One health sample of the device, with the alerts derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub temperature_c: Option<f32>,
    pub disk_percent: f32,
    pub services: BTreeMap<String, ServiceState>,
    #[serde(default)]
    pub missing_artifacts: Vec<String>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl MetricsSnapshot {
    /// Freeze a probe reading into a snapshot, evaluating thresholds once.
    pub fn from_reading(reading: HostReading, thresholds: &Thresholds) -> Self {
        let mut snapshot = Self {
            timestamp: Utc::now(),
            cpu_percent: reading.cpu_percent,
            memory_percent: reading.memory_percent,
            temperature_c: reading.temperature_c,
            disk_percent: reading.disk_percent,
            services: reading.services,
            missing_artifacts: reading.missing_artifacts,
            alerts: vec![],
        };
        snapshot.alerts = evaluate(&snapshot, thresholds);
        snapshot
    }

    pub fn has_critical(&self) -> bool {
        self.alerts
            .iter()
            .any(|alert| alert.level == AlertLevel::Critical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Temperature,
    Disk,
    Memory,
    Service,
    Application,
}
