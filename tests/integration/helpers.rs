//! Helper functions for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use venue_fleet::{
    actions::SimulatedRunner,
    config::{BackoffConfig, LinkConfig},
    executor::CommandExecutor,
    jobs::{JobStatus, JobStore, JobUpdate},
};

pub fn create_test_executor(dir: &Path) -> CommandExecutor {
    let store = JobStore::open(dir.join("jobs.json")).unwrap();
    CommandExecutor::new(
        Arc::new(SimulatedRunner::new(Duration::from_millis(10))),
        store,
    )
}

pub fn create_test_link_config(url: String, identity_file: &Path) -> LinkConfig {
    LinkConfig {
        url,
        identity_file: identity_file.to_path_buf(),
        heartbeat_interval_secs: 1,
        connect_timeout_secs: 1,
        auth_timeout_secs: 2,
        backoff: BackoffConfig {
            initial_ms: 50,
            max_ms: 200,
            multiplier: 2.0,
        },
    }
}

pub fn write_media(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), b"video").unwrap();
    }
}

pub fn write_content(dir: &Path, json: &str) {
    std::fs::write(dir.join("content.json"), json).unwrap();
}

/// Collect updates until `count` jobs reached a terminal status
pub async fn collect_until_terminal(
    subscription: &mut venue_fleet::executor::Subscription,
    count: usize,
) -> Vec<JobUpdate> {
    let mut updates = vec![];
    tokio::time::timeout(Duration::from_secs(5), async {
        while updates
            .iter()
            .filter(|update: &&JobUpdate| update.status.is_terminal())
            .count()
            < count
        {
            match subscription.recv().await {
                Some(update) => updates.push(update),
                None => break,
            }
        }
    })
    .await
    .expect("jobs did not finish in time");
    updates
}

pub fn statuses_for(updates: &[JobUpdate], job_id: &str) -> Vec<JobStatus> {
    updates
        .iter()
        .filter(|update| update.job_id == job_id)
        .map(|update| update.status)
        .collect()
}

#[cfg(feature = "registry")]
pub mod registry {
    use std::net::SocketAddr;
    use std::path::Path;
    use std::time::Duration;

    use tokio::sync::broadcast;
    use venue_fleet::registry::{
        RegistryState, credentials::CredentialStore, notify::AlertNotifier,
        spawn_registry_server, state::DeviceEvent,
    };

    pub async fn start_registry(
        dir: &Path,
        notifier: Option<AlertNotifier>,
    ) -> (SocketAddr, RegistryState) {
        let credentials = CredentialStore::open(dir.join("credentials.json")).unwrap();
        let state = RegistryState::new(
            credentials,
            notifier,
            Duration::from_secs(90),
            Duration::from_secs(2),
        );
        let addr = spawn_registry_server("127.0.0.1:0".parse().unwrap(), state.clone())
            .await
            .unwrap();
        (addr, state)
    }

    /// Wait for the first event matching `predicate`, skipping everything else
    pub async fn wait_for_event<F>(
        events: &mut broadcast::Receiver<DeviceEvent>,
        mut predicate: F,
    ) -> DeviceEvent
    where
        F: FnMut(&DeviceEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("expected event did not arrive")
    }
}
