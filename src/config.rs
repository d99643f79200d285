use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::trace;

use crate::actions::Action;

/// Heartbeat intervals an online link tolerates without any inbound frame
const LIVENESS_HEARTBEATS: u32 = 3;

/// Edge agent configuration (TOML)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// WebSocket endpoint of the registry
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Device identity file, re-read before every connection attempt
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Upper bound on TCP connect plus WebSocket upgrade
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            identity_file: default_identity_file(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_timeout_secs: default_connect_timeout(),
            auth_timeout_secs: default_auth_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Silence on an online session longer than this drops the connection
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval() * LIVENESS_HEARTBEATS
    }
}

/// Reconnection backoff. Retries are never capped in count, only in delay.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,

    /// systemd units that must be running
    #[serde(default)]
    pub services: Vec<String>,

    /// Files the player installation must contain
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,

    /// Mount point whose usage is reported as disk usage
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,

    #[serde(default)]
    pub thresholds: Thresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval(),
            services: vec![],
            artifacts: vec![],
            disk_mount: default_disk_mount(),
            thresholds: Thresholds::default(),
        }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_temperature_limit")]
    pub temperature_c: f32,

    #[serde(default = "default_usage_limit")]
    pub disk_percent: f32,

    #[serde(default = "default_usage_limit")]
    pub memory_percent: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature_c: default_temperature_limit(),
            disk_percent: default_usage_limit(),
            memory_percent: default_usage_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_phase_file")]
    pub phase_file: PathBuf,

    #[serde(default = "default_playlist_file")]
    pub playlist_file: PathBuf,

    /// Sponsor loop and time-category media lists
    #[serde(default = "default_content_file")]
    pub content_file: PathBuf,

    /// Base directories media names are resolved against, in order
    #[serde(default)]
    pub media_dirs: Vec<PathBuf>,

    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            phase_file: default_phase_file(),
            playlist_file: default_playlist_file(),
            content_file: default_content_file(),
            media_dirs: vec![],
            watch_interval_secs: default_watch_interval(),
        }
    }
}

impl PlaybackConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Fixed delays, then success
    #[default]
    Simulated,
    /// External programs configured per action
    Hooks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_job_store")]
    pub store_file: PathBuf,

    #[serde(default)]
    pub runner: RunnerKind,

    #[serde(default = "default_simulated_step")]
    pub simulated_step_ms: u64,

    /// Keyed by action name, e.g. `[jobs.hooks.deploy-raspberry]`
    #[serde(default)]
    pub hooks: BTreeMap<String, HookConfig>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            store_file: default_job_store(),
            runner: RunnerKind::default(),
            simulated_step_ms: default_simulated_step(),
            hooks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HookConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl JobsConfig {
    pub fn simulated_step(&self) -> Duration {
        Duration::from_millis(self.simulated_step_ms)
    }

    /// Hooks keyed by their parsed action.
    pub fn resolved_hooks(&self) -> anyhow::Result<BTreeMap<Action, HookConfig>> {
        self.hooks
            .iter()
            .map(|(name, hook)| {
                let action = name
                    .parse::<Action>()
                    .with_context(|| format!("jobs.hooks.{name} does not name an action"))?;
                Ok((action, hook.clone()))
            })
            .collect()
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::load_from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    pub fn load_from_str(content: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        trace!("loaded agent config: {config:?}");
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.link.heartbeat_interval_secs > 0,
            "link.heartbeat_interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.link.connect_timeout_secs > 0,
            "link.connect_timeout_secs must be > 0"
        );
        anyhow::ensure!(
            self.link.auth_timeout_secs > 0,
            "link.auth_timeout_secs must be > 0"
        );
        anyhow::ensure!(
            self.link.backoff.initial_ms > 0,
            "link.backoff.initial_ms must be > 0, retries would busy-loop"
        );
        anyhow::ensure!(
            self.link.backoff.max_ms >= self.link.backoff.initial_ms,
            "link.backoff.max_ms must be >= link.backoff.initial_ms"
        );
        anyhow::ensure!(
            self.link.backoff.multiplier >= 1.0,
            "link.backoff.multiplier must be >= 1.0, got {}",
            self.link.backoff.multiplier
        );
        anyhow::ensure!(
            self.metrics.interval_secs > 0,
            "metrics.interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.playback.watch_interval_secs > 0,
            "playback.watch_interval_secs must be > 0"
        );
        self.jobs.resolved_hooks()?;
        if self.jobs.runner == RunnerKind::Hooks {
            anyhow::ensure!(
                !self.jobs.hooks.is_empty(),
                "jobs.runner = \"hooks\" requires at least one [jobs.hooks.<action>] entry"
            );
        }
        Ok(())
    }
}

/// Reference registry configuration (TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,

    /// A device without a heartbeat for this long is reported offline
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Receives new critical alerts reported by devices
    pub webhook_url: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            credentials_file: default_credentials_file(),
            stale_after_secs: default_stale_after(),
            auth_timeout_secs: default_auth_timeout(),
            webhook_url: None,
        }
    }
}

impl RegistryConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: RegistryConfig = toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        anyhow::ensure!(config.stale_after_secs > 0, "stale_after_secs must be > 0");
        anyhow::ensure!(config.auth_timeout_secs > 0, "auth_timeout_secs must be > 0");
        trace!("loaded registry config: {config:?}");
        Ok(config)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

fn default_registry_url() -> String {
    String::from("ws://127.0.0.1:8080/ws")
}

fn default_identity_file() -> PathBuf {
    PathBuf::from("./identity.json")
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_backoff_initial() -> u64 {
    1_000
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_metrics_interval() -> u64 {
    300
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_temperature_limit() -> f32 {
    75.0
}

fn default_usage_limit() -> f32 {
    90.0
}

fn default_phase_file() -> PathBuf {
    PathBuf::from("./state/phase")
}

fn default_playlist_file() -> PathBuf {
    PathBuf::from("./state/playlist.txt")
}

fn default_content_file() -> PathBuf {
    PathBuf::from("./content.json")
}

fn default_watch_interval() -> u64 {
    5
}

fn default_job_store() -> PathBuf {
    PathBuf::from("./state/jobs.json")
}

fn default_simulated_step() -> u64 {
    500
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("./credentials.json")
}

fn default_stale_after() -> u64 {
    90
}
