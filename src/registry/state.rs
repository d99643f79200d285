//! Shared registry state: credentials, live device connections and their latest reports

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    MetricsSnapshot,
    config::RegistryConfig,
    identity::DeviceIdentity,
    jobs::JobUpdate,
    protocol::{ResultStatus, WireMessage},
    registry::{
        credentials::CredentialStore,
        notify::{AlertNotifier, new_critical_alerts},
    },
};

/// Command results kept per site for the detail endpoint
pub const MAX_RECENT_RESULTS: usize = 50;

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub id: String,
    pub status: ResultStatus,
    pub summary: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected { site_id: String },
    Rejected { site_id: Option<String>, reason: String },
    Message { site_id: String, message: WireMessage },
    Disconnected { site_id: String },
}

#[derive(Debug)]
struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<WireMessage>,
}

#[derive(Debug, Default)]
struct DeviceRecord {
    connection: Option<Connection>,
    connected_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    last_metrics: Option<MetricsSnapshot>,
    last_job: Option<JobUpdate>,
    results: VecDeque<CommandOutcome>,
}

/// Point-in-time view of one site
#[derive(Debug, Clone)]
pub struct SiteView {
    pub site_id: String,
    pub online: bool,
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub latest_metrics: Option<MetricsSnapshot>,
    pub last_job: Option<JobUpdate>,
    pub recent_results: Vec<CommandOutcome>,
}

/// Registration of a freshly authenticated connection
#[derive(Debug)]
pub struct Registration {
    pub connection_id: u64,
    pub outbound: mpsc::UnboundedReceiver<WireMessage>,
}

#[derive(Clone)]
pub struct RegistryState {
    inner: Arc<Inner>,
}

struct Inner {
    credentials: RwLock<CredentialStore>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    events: broadcast::Sender<DeviceEvent>,
    notifier: Option<AlertNotifier>,
    stale_after: Duration,
    auth_timeout: Duration,
    next_connection: AtomicU64,
}

impl RegistryState {
    pub fn new(
        credentials: CredentialStore,
        notifier: Option<AlertNotifier>,
        stale_after: Duration,
        auth_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                credentials: RwLock::new(credentials),
                devices: RwLock::new(HashMap::new()),
                events,
                notifier,
                stale_after,
                auth_timeout,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> anyhow::Result<Self> {
        let credentials = CredentialStore::open(&config.credentials_file)?;
        let notifier = config
            .webhook_url
            .as_deref()
            .map(AlertNotifier::new)
            .transpose()?;
        Ok(Self::new(
            credentials,
            notifier,
            config.stale_after(),
            config.auth_timeout(),
        ))
    }

    pub fn auth_timeout(&self) -> Duration {
        self.inner.auth_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: DeviceEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub async fn validate(&self, site_id: &str, api_key: &str) -> bool {
        self.inner.credentials.read().await.validate(site_id, api_key)
    }

    pub fn reject(&self, site_id: Option<String>, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("rejected device connection ({site_id:?}): {reason}");
        self.publish(DeviceEvent::Rejected { site_id, reason });
    }

    /// Register an authenticated connection, replacing any previous one for the site.
    pub async fn connect(&self, site_id: &str) -> Registration {
        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut devices = self.inner.devices.write().await;
            let record = devices.entry(site_id.to_string()).or_default();
            if record.connection.is_some() {
                info!("{site_id} reconnected, dropping previous connection");
            }
            record.connection = Some(Connection {
                id: connection_id,
                outbound: tx,
            });
            record.connected_at = Some(Utc::now());
            record.last_heartbeat_at = None;
        }

        info!("{site_id} connected");
        self.publish(DeviceEvent::Connected {
            site_id: site_id.to_string(),
        });
        Registration {
            connection_id,
            outbound: rx,
        }
    }

    /// Forget the connection unless it was already replaced by a newer one.
    pub async fn disconnect(&self, site_id: &str, connection_id: u64) {
        let removed = {
            let mut devices = self.inner.devices.write().await;
            match devices.get_mut(site_id) {
                Some(record)
                    if record
                        .connection
                        .as_ref()
                        .is_some_and(|connection| connection.id == connection_id) =>
                {
                    record.connection = None;
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!("{site_id} disconnected");
            self.publish(DeviceEvent::Disconnected {
                site_id: site_id.to_string(),
            });
        }
    }

    /// Apply a message received from an authenticated device.
    pub async fn record(&self, site_id: &str, message: WireMessage) {
        let mut alerts_to_send = vec![];
        {
            let mut devices = self.inner.devices.write().await;
            let record = devices.entry(site_id.to_string()).or_default();
            match &message {
                WireMessage::Heartbeat { .. } => {
                    record.last_heartbeat_at = Some(Utc::now());
                }
                WireMessage::Metrics { snapshot, .. } => {
                    alerts_to_send = new_critical_alerts(record.last_metrics.as_ref(), snapshot);
                    record.last_metrics = Some(snapshot.clone());
                }
                WireMessage::CommandResult {
                    id,
                    status,
                    summary,
                } => {
                    record.results.push_back(CommandOutcome {
                        id: id.clone(),
                        status: *status,
                        summary: summary.clone(),
                        received_at: Utc::now(),
                    });
                    while record.results.len() > MAX_RECENT_RESULTS {
                        record.results.pop_front();
                    }
                }
                WireMessage::JobUpdate(update) => {
                    record.last_job = Some(update.clone());
                }
                other => {
                    debug!("ignoring {} from {site_id}", other.kind());
                }
            }
        }

        if !alerts_to_send.is_empty()
            && let Some(notifier) = self.inner.notifier.clone()
        {
            let site_id = site_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&site_id, alerts_to_send).await {
                    warn!("failed to notify webhook for {site_id}: {e:#}");
                }
            });
        }

        self.publish(DeviceEvent::Message {
            site_id: site_id.to_string(),
            message,
        });
    }

    /// Queue a message for a connected site. Returns `false` if the site has no live connection.
    pub async fn dispatch(&self, site_id: &str, message: WireMessage) -> bool {
        let devices = self.inner.devices.read().await;
        devices
            .get(site_id)
            .and_then(|record| record.connection.as_ref())
            .is_some_and(|connection| connection.outbound.send(message).is_ok())
    }

    /// Issue (or rotate) credentials for a site. A live session on the old key is dropped.
    pub async fn issue(&self, site_id: &str) -> anyhow::Result<DeviceIdentity> {
        let identity = self.inner.credentials.write().await.issue(site_id)?;

        let dropped = self
            .inner
            .devices
            .write()
            .await
            .get_mut(site_id)
            .and_then(|record| record.connection.take())
            .is_some();
        if dropped {
            info!("dropped live session of {site_id} after credential rotation");
            self.publish(DeviceEvent::Disconnected {
                site_id: site_id.to_string(),
            });
        }
        Ok(identity)
    }

    pub async fn is_known(&self, site_id: &str) -> bool {
        self.inner.credentials.read().await.contains(site_id)
            || self.inner.devices.read().await.contains_key(site_id)
    }

    fn view(&self, site_id: &str, record: &DeviceRecord, now: DateTime<Utc>) -> SiteView {
        let connected = record.connection.is_some();
        let last_seen = record.last_heartbeat_at.or(record.connected_at);
        let online = connected
            && last_seen.is_some_and(|seen| {
                (now - seen)
                    .to_std()
                    .map(|elapsed| elapsed <= self.inner.stale_after)
                    .unwrap_or(true)
            });

        SiteView {
            site_id: site_id.to_string(),
            online,
            connected,
            connected_at: record.connected_at,
            last_heartbeat_at: record.last_heartbeat_at,
            latest_metrics: record.last_metrics.clone(),
            last_job: record.last_job.clone(),
            recent_results: record.results.iter().cloned().collect(),
        }
    }

    /// All provisioned or seen sites, sorted by id
    pub async fn sites(&self) -> Vec<SiteView> {
        let now = Utc::now();
        let mut ids: Vec<String> = self
            .inner
            .credentials
            .read()
            .await
            .sites()
            .map(str::to_string)
            .collect();

        let devices = self.inner.devices.read().await;
        ids.extend(devices.keys().cloned());
        ids.sort();
        ids.dedup();

        let empty = DeviceRecord::default();
        ids.iter()
            .map(|id| self.view(id, devices.get(id).unwrap_or(&empty), now))
            .collect()
    }

    pub async fn site(&self, site_id: &str) -> Option<SiteView> {
        if !self.is_known(site_id).await {
            return None;
        }
        let devices = self.inner.devices.read().await;
        let empty = DeviceRecord::default();
        Some(self.view(
            site_id,
            devices.get(site_id).unwrap_or(&empty),
            Utc::now(),
        ))
    }
}
