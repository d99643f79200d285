//! End-to-end tests: a real FleetLink against the reference registry
//!
//! - Handshake success and rejection
//! - Heartbeats and metrics reach the registry
//! - Commands come back as job updates and results
//! - set_phase switches the device playlist
//! - Reconnects after drops, timeouts and silent registries
//! - Results produced while offline are sent after reconnecting

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use venue_fleet::{
    MetricsSnapshot,
    actors::{link::FleetLinkHandle, messages::LinkStatus, playback::PlaybackHandle},
    config::Thresholds,
    content::ContentSource,
    executor::CommandExecutor,
    identity::DeviceIdentity,
    monitors::probe::HostReading,
    phase::{Phase, PhaseMachine, PhaseStore},
    playlist::PlaylistBuilder,
    protocol::{Command, ResultStatus, WireMessage},
    registry::{RegistryState, state::DeviceEvent},
};

use crate::helpers::{registry::*, *};

struct Agent {
    link: FleetLinkHandle,
    snapshots: broadcast::Sender<MetricsSnapshot>,
}

fn spawn_agent(
    dir: &Path,
    addr: SocketAddr,
    identity: &DeviceIdentity,
    playback: Option<PlaybackHandle>,
) -> Agent {
    spawn_agent_with(dir, addr, identity, playback, create_test_executor(dir))
}

fn spawn_agent_with(
    dir: &Path,
    addr: SocketAddr,
    identity: &DeviceIdentity,
    playback: Option<PlaybackHandle>,
    executor: CommandExecutor,
) -> Agent {
    let identity_file = dir.join("identity.json");
    identity.save(&identity_file).unwrap();

    let (snapshots, snapshot_rx) = broadcast::channel(16);
    let link = FleetLinkHandle::spawn(
        create_test_link_config(format!("ws://{addr}/ws"), &identity_file),
        executor,
        playback,
        snapshot_rx,
    );
    Agent { link, snapshots }
}

async fn provisioned(state: &RegistryState) -> DeviceIdentity {
    state.issue("arena-north").await.unwrap()
}

/// Wait until the link reports a status matching `predicate`
async fn wait_for_status<F>(link: &FleetLinkHandle, mut predicate: F) -> LinkStatus
where
    F: FnMut(&LinkStatus) -> bool,
{
    let mut receiver = link.status_receiver();
    let status = tokio::time::timeout(Duration::from_secs(10), receiver.wait_for(|s| predicate(s)))
        .await
        .expect("link never reached the expected status")
        .unwrap()
        .clone();
    status
}

fn last_error_contains(status: &LinkStatus, needle: &str) -> bool {
    matches!(status, LinkStatus::Connecting { last_error: Some(error), .. } if error.contains(needle))
}

/// A WebSocket endpoint that upgrades and then never reads again.
/// With `authenticate` it first answers the handshake.
async fn start_mute_registry(authenticate: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                if authenticate {
                    let _ = socket.next().await;
                    let reply = WireMessage::Authenticated {
                        message: "welcome".to_string(),
                    };
                    let _ = socket.send(Message::Text(reply.encode().unwrap())).await;
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(socket);
            });
        }
    });
    addr
}

fn is_from(event: &DeviceEvent, site: &str) -> Option<WireMessage> {
    match event {
        DeviceEvent::Message { site_id, message } if site_id == site => Some(message.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn test_agent_authenticates_and_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;
    let mut events = state.subscribe();

    let agent = spawn_agent(dir.path(), addr, &identity, None);
    let session = agent.link.wait_online(Duration::from_secs(5)).await.unwrap();
    assert!(session.authenticated);

    wait_for_event(&mut events, |event| {
        matches!(is_from(event, "arena-north"), Some(WireMessage::Heartbeat { .. }))
    })
    .await;

    let site = state.site("arena-north").await.unwrap();
    assert!(site.online);
    assert!(site.last_heartbeat_at.is_some());
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_credentials_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    provisioned(&state).await;
    let mut events = state.subscribe();

    let forged = DeviceIdentity::new("arena-north", "not-the-key");
    let agent = spawn_agent(dir.path(), addr, &forged, None);

    let event = wait_for_event(&mut events, |event| {
        matches!(event, DeviceEvent::Rejected { .. })
    })
    .await;
    assert_matches!(event, DeviceEvent::Rejected { site_id: Some(site), .. } if site == "arena-north");

    let mut status = agent.link.status_receiver();
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|status| matches!(status, LinkStatus::Connecting { last_error: Some(_), .. })),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_matches!(status, LinkStatus::Connecting { last_error: Some(error), .. } => {
        assert!(error.contains("invalid credentials"), "unexpected error: {error}");
    });

    assert!(!state.site("arena-north").await.unwrap().connected);
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_first_frame_must_authenticate() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _state) = start_registry(dir.path(), None).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let heartbeat = WireMessage::Heartbeat {
        site_id: "arena-north".to_string(),
        timestamp: chrono::Utc::now(),
    };
    socket
        .send(Message::Text(heartbeat.encode().unwrap()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = reply.into_text().unwrap();
    assert_matches!(
        WireMessage::decode(&text).unwrap(),
        WireMessage::AuthError { .. }
    );
}

#[tokio::test]
async fn test_metrics_are_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;
    let mut events = state.subscribe();

    let agent = spawn_agent(dir.path(), addr, &identity, None);
    agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    let snapshot = MetricsSnapshot::from_reading(
        HostReading {
            cpu_percent: 12.5,
            temperature_c: Some(81.0),
            ..HostReading::default()
        },
        &Thresholds::default(),
    );
    agent.snapshots.send(snapshot.clone()).unwrap();

    let event = wait_for_event(&mut events, |event| {
        matches!(is_from(event, "arena-north"), Some(WireMessage::Metrics { .. }))
    })
    .await;
    assert_matches!(is_from(&event, "arena-north"), Some(WireMessage::Metrics { snapshot: received, .. }) => {
        assert_eq!(received, snapshot);
        assert!(received.has_critical());
    });

    let site = state.site("arena-north").await.unwrap();
    assert_eq!(site.latest_metrics, Some(snapshot));
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_command_result_reaches_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;
    let mut events = state.subscribe();

    let agent = spawn_agent(dir.path(), addr, &identity, None);
    agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    let command = Command::new("build:central").with_parameter("branch", "main");
    assert!(
        state
            .dispatch("arena-north", WireMessage::Command(command.clone()))
            .await
    );

    let event = wait_for_event(&mut events, |event| {
        matches!(is_from(event, "arena-north"), Some(WireMessage::CommandResult { .. }))
    })
    .await;
    assert_matches!(
        is_from(&event, "arena-north"),
        Some(WireMessage::CommandResult { id, status: ResultStatus::Succeeded, summary: Some(_) }) if id == command.id
    );

    let site = state.site("arena-north").await.unwrap();
    assert_eq!(site.recent_results.len(), 1);
    assert_matches!(site.last_job, Some(job) if job.command_id == command.id);
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;
    let mut events = state.subscribe();

    let agent = spawn_agent(dir.path(), addr, &identity, None);
    agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    let command = Command::new("format-disk");
    state
        .dispatch("arena-north", WireMessage::Command(command.clone()))
        .await;

    let event = wait_for_event(&mut events, |event| {
        matches!(is_from(event, "arena-north"), Some(WireMessage::CommandResult { .. }))
    })
    .await;
    assert_matches!(
        is_from(&event, "arena-north"),
        Some(WireMessage::CommandResult { status: ResultStatus::Rejected, summary: Some(reason), .. }) => {
            assert!(reason.contains("format-disk"));
        }
    );
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_phase_switches_playlist() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;

    write_media(dir.path(), &["loop.mp4", "halftime.mp4"]);
    write_content(
        dir.path(),
        r#"{"sponsorLoop": ["loop.mp4"], "timeCategories": {"during": ["halftime.mp4"]}}"#,
    );
    let machine = PhaseMachine::restore(
        PhaseStore::new(dir.path().join("phase")),
        PlaylistBuilder::new(vec![dir.path().to_path_buf()], dir.path().join("playlist.txt")),
        ContentSource::new(dir.path().join("content.json")),
    );
    let playback = PlaybackHandle::spawn(machine, Duration::from_secs(3600));

    let agent = spawn_agent(dir.path(), addr, &identity, Some(playback.clone()));
    agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    assert!(
        state
            .dispatch("arena-north", WireMessage::SetPhase { phase: Phase::During })
            .await
    );

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = playback.status().await.unwrap();
            if status.phase == Phase::During {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("phase was not applied");

    let entries = status.last_rebuild.unwrap().entries;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].display_name, "halftime");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("phase")).unwrap().trim(),
        "during"
    );

    agent.link.shutdown().await.unwrap();
    playback.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unresponsive_registry_times_out_connect() {
    let dir = tempfile::tempdir().unwrap();
    // accepts TCP but never completes the upgrade
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = vec![];
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });

    let identity = DeviceIdentity::new("arena-north", "key");
    let agent = spawn_agent(dir.path(), addr, &identity, None);

    let status = wait_for_status(&agent.link, |status| {
        matches!(status, LinkStatus::Connecting { attempt, .. } if *attempt >= 2)
    })
    .await;
    assert!(
        last_error_contains(&status, "could not reach registry within 1s"),
        "unexpected status: {status:?}"
    );
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_handshake_reply_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_mute_registry(false).await;

    let identity = DeviceIdentity::new("arena-north", "key");
    let agent = spawn_agent(dir.path(), addr, &identity, None);

    let status = wait_for_status(&agent.link, |status| {
        last_error_contains(status, "no handshake response within 2s")
    })
    .await;
    assert!(!status.is_online());
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_session_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_mute_registry(true).await;

    let identity = DeviceIdentity::new("arena-north", "key");
    let agent = spawn_agent(dir.path(), addr, &identity, None);
    agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    // pings go unanswered, so the session must end on its own
    let status = wait_for_status(&agent.link, |status| {
        last_error_contains(status, "no traffic from registry")
    })
    .await;
    assert_matches!(status, LinkStatus::Connecting { attempt: 1, .. });
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_answered_pings_keep_session_alive() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;

    let agent = spawn_agent(dir.path(), addr, &identity, None);
    let session = agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    // well past three heartbeat intervals
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_matches!(agent.link.status(), LinkStatus::Online(current) => {
        assert_eq!(current.connected_at, session.connected_at);
    });
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reauthenticates_after_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;

    let agent = spawn_agent(dir.path(), addr, &identity, None);
    let first = agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    // rotation drops the live session; the new key is picked up from disk
    let rotated = state.issue("arena-north").await.unwrap();
    rotated.save(&dir.path().join("identity.json")).unwrap();

    let status = wait_for_status(&agent.link, |status| {
        matches!(status, LinkStatus::Online(session) if session.connected_at > first.connected_at)
    })
    .await;
    assert!(status.is_online());
    assert!(state.site("arena-north").await.unwrap().connected);
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fixed_identity_file_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;
    let mut events = state.subscribe();

    let forged = DeviceIdentity::new("arena-north", "not-the-key");
    let agent = spawn_agent(dir.path(), addr, &forged, None);
    wait_for_event(&mut events, |event| {
        matches!(event, DeviceEvent::Rejected { .. })
    })
    .await;

    identity.save(&dir.path().join("identity.json")).unwrap();

    let session = agent.link.wait_online(Duration::from_secs(5)).await.unwrap();
    assert!(session.authenticated);
    wait_for_event(&mut events, |event| {
        matches!(event, DeviceEvent::Connected { site_id } if site_id == "arena-north")
    })
    .await;
    agent.link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_offline_results_are_sent_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state) = start_registry(dir.path(), None).await;
    let identity = provisioned(&state).await;
    let mut events = state.subscribe();

    let executor = create_test_executor(dir.path());
    let forged = DeviceIdentity::new("arena-north", "not-the-key");
    let agent = spawn_agent_with(dir.path(), addr, &forged, None, executor.clone());

    // the job runs to completion while the link cannot authenticate
    let mut local = executor.subscribe();
    let command = Command::new("sync-clients");
    executor.submit(&command).unwrap();
    collect_until_terminal(&mut local, 1).await;
    assert!(!agent.link.status().is_online());

    identity.save(&dir.path().join("identity.json")).unwrap();
    agent.link.wait_online(Duration::from_secs(5)).await.unwrap();

    let event = wait_for_event(&mut events, |event| {
        matches!(is_from(event, "arena-north"), Some(WireMessage::CommandResult { .. }))
    })
    .await;
    assert_matches!(
        is_from(&event, "arena-north"),
        Some(WireMessage::CommandResult { id, status: ResultStatus::Succeeded, .. }) if id == command.id
    );

    let site = state.site("arena-north").await.unwrap();
    assert_matches!(site.last_job, Some(job) if job.command_id == command.id);
    agent.link.shutdown().await.unwrap();
}
