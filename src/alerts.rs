//! Threshold evaluation for metrics snapshots
//!
//! Every check runs independently, so several alerts may fire for the same snapshot.
//!
//! ```text
//! temperatureC  > limit  → critical / temperature
//! diskPercent   > limit  → warning  / disk
//! memoryPercent > limit  → warning  / memory
//! service not running    → critical / service      (one per service)
//! artifact missing       → critical / application  (one per artifact)
//! ```

use crate::{Alert, AlertKind, AlertLevel, MetricsSnapshot, ServiceState, config::Thresholds};

/// Derive the alerts for a snapshot. Pure and total.
pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &Thresholds) -> Vec<Alert> {
    let mut alerts = vec![];

    if let Some(temperature) = snapshot.temperature_c
        && temperature > thresholds.temperature_c
    {
        alerts.push(Alert {
            level: AlertLevel::Critical,
            kind: AlertKind::Temperature,
            message: format!(
                "temperature {temperature:.1}°C exceeds {:.1}°C",
                thresholds.temperature_c
            ),
            value: Some(f64::from(temperature)),
        });
    }

    if snapshot.disk_percent > thresholds.disk_percent {
        alerts.push(Alert {
            level: AlertLevel::Warning,
            kind: AlertKind::Disk,
            message: format!(
                "disk usage {:.1}% exceeds {:.1}%",
                snapshot.disk_percent, thresholds.disk_percent
            ),
            value: Some(f64::from(snapshot.disk_percent)),
        });
    }

    if snapshot.memory_percent > thresholds.memory_percent {
        alerts.push(Alert {
            level: AlertLevel::Warning,
            kind: AlertKind::Memory,
            message: format!(
                "memory usage {:.1}% exceeds {:.1}%",
                snapshot.memory_percent, thresholds.memory_percent
            ),
            value: Some(f64::from(snapshot.memory_percent)),
        });
    }

    for (service, state) in &snapshot.services {
        if *state != ServiceState::Running {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                kind: AlertKind::Service,
                message: format!("service {service} is not running"),
                value: None,
            });
        }
    }

    for artifact in &snapshot.missing_artifacts {
        alerts.push(Alert {
            level: AlertLevel::Critical,
            kind: AlertKind::Application,
            message: format!("expected artifact {artifact} is missing"),
            value: None,
        });
    }

    alerts
}
