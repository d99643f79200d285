//! Integration tests for the registry REST surface and alert webhook

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;
use venue_fleet::{
    MetricsSnapshot,
    config::Thresholds,
    identity::DeviceIdentity,
    monitors::probe::HostReading,
    protocol::WireMessage,
    registry::{
        notify::AlertNotifier,
        types::{CommandAccepted, SiteDetail, SiteStatus, SitesResponse},
    },
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::registry::*;

fn hot_snapshot(temperature: f32) -> MetricsSnapshot {
    MetricsSnapshot::from_reading(
        HostReading {
            temperature_c: Some(temperature),
            ..HostReading::default()
        },
        &Thresholds::default(),
    )
}

#[tokio::test]
async fn test_issue_and_list_sites() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _state) = start_registry(dir.path(), None).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/api/v1/sites/arena-north/credentials"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let identity: DeviceIdentity = response.json().await.unwrap();
    assert_eq!(identity.site_id, "arena-north");
    assert!(!identity.api_key.is_empty());

    let sites: SitesResponse = client
        .get(format!("http://{addr}/api/v1/sites"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sites.count, 1);
    assert_eq!(sites.sites[0].site_id, "arena-north");
    assert_eq!(sites.sites[0].status, SiteStatus::Offline);
}

#[tokio::test]
async fn test_command_to_offline_site() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    state.issue("arena-north").await.unwrap();
    let client = reqwest::Client::new();

    let unknown = client
        .post(format!("http://{addr}/api/v1/sites/nowhere/commands"))
        .json(&json!({"action": "build-central"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let offline = client
        .post(format!("http://{addr}/api/v1/sites/arena-north/commands"))
        .json(&json!({"action": "build-central"}))
        .send()
        .await
        .unwrap();
    assert_eq!(offline.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_command_is_queued_for_connected_site() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    state.issue("arena-north").await.unwrap();
    let mut registration = state.connect("arena-north").await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/api/v1/sites/arena-north/commands"))
        .json(&json!({
            "id": "cmd-42",
            "action": "sync:clients",
            "parameters": {"target": "lobby"},
            "requestedBy": "ops"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted: CommandAccepted = response.json().await.unwrap();
    assert_eq!(accepted.command_id, "cmd-42");

    let Some(WireMessage::Command(command)) = registration.outbound.recv().await else {
        panic!("expected a command frame");
    };
    assert_eq!(command.id, "cmd-42");
    assert_eq!(command.action, "sync:clients");
    assert_eq!(command.requested_by.as_deref(), Some("ops"));

    let detail: SiteDetail = client
        .get(format!("http://{addr}/api/v1/sites/arena-north"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(detail.site.connected);
    assert_eq!(detail.site.status, SiteStatus::Online);
}

#[tokio::test]
async fn test_new_critical_alerts_notify_once() {
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let notifier = AlertNotifier::new(format!("{}/alerts", webhook.uri())).unwrap();
    let (_addr, state) = start_registry(dir.path(), Some(notifier)).await;
    let _registration = state.connect("arena-north").await;

    for temperature in [80.0, 83.0] {
        state
            .record(
                "arena-north",
                WireMessage::Metrics {
                    site_id: "arena-north".to_string(),
                    snapshot: hot_snapshot(temperature),
                },
            )
            .await;
    }

    // delivery runs in the background
    tokio::time::sleep(Duration::from_millis(300)).await;
    webhook.verify().await;
}
