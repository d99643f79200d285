//! Webhook notification for critical alerts reported by devices

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, instrument};

use crate::{Alert, AlertKind, AlertLevel, MetricsSnapshot};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotification {
    pub site_id: String,
    pub timestamp: DateTime<Utc>,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone)]
pub struct AlertNotifier {
    client: Client,
    url: String,
}

impl AlertNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    #[instrument(skip(self, alerts))]
    pub async fn notify(&self, site_id: &str, alerts: Vec<Alert>) -> anyhow::Result<()> {
        let notification = AlertNotification {
            site_id: site_id.to_string(),
            timestamp: Utc::now(),
            alerts,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .context("failed to send webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }

        info!(
            "notified webhook about {} critical alert(s)",
            notification.alerts.len()
        );
        Ok(())
    }
}

// threshold alerts carry the measured value in their message, so only their kind identifies them
fn alert_key(alert: &Alert) -> (AlertKind, Option<&str>) {
    match alert.kind {
        AlertKind::Temperature | AlertKind::Disk | AlertKind::Memory => (alert.kind, None),
        AlertKind::Service | AlertKind::Application => (alert.kind, Some(alert.message.as_str())),
    }
}

/// Critical alerts in `current` that were not already present in `previous`
pub fn new_critical_alerts(previous: Option<&MetricsSnapshot>, current: &MetricsSnapshot) -> Vec<Alert> {
    let known = previous
        .map(|snapshot| {
            snapshot
                .alerts
                .iter()
                .filter(|alert| alert.level == AlertLevel::Critical)
                .map(alert_key)
                .collect::<HashSet<_>>()
        })
        .unwrap_or_default();

    current
        .alerts
        .iter()
        .filter(|alert| alert.level == AlertLevel::Critical && !known.contains(&alert_key(alert)))
        .cloned()
        .collect()
}
