use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sysinfo::{Components, Disks, System};
use tracing::{trace, warn};

use crate::{ServiceState, config::MetricsConfig};

/// Raw host values before thresholds are applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReading {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub temperature_c: Option<f32>,
    pub disk_percent: f32,
    pub services: BTreeMap<String, ServiceState>,
    pub missing_artifacts: Vec<String>,
}

/// Source of host readings. Sampling never fails; unavailable values degrade to zero or
/// `None`.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn sample(&self) -> HostReading;
}

/// Probe backed by `sysinfo`, `systemctl` and the filesystem
pub struct SystemProbe {
    system: Arc<Mutex<Option<System>>>,
    services: Vec<String>,
    artifacts: Vec<PathBuf>,
    disk_mount: PathBuf,
}

impl SystemProbe {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            system: Arc::new(Mutex::new(None)),
            services: config.services.clone(),
            artifacts: config.artifacts.clone(),
            disk_mount: config.disk_mount.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    cpu_percent: f32,
    memory_percent: f32,
    temperature_c: Option<f32>,
    disk_percent: f32,
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    }
}

// blocking: the first call waits for a second CPU refresh
fn read_usage(system: &Mutex<Option<System>>, disk_mount: &Path) -> Usage {
    let mut guard = system.lock().unwrap_or_else(PoisonError::into_inner);
    let sys = guard.get_or_insert_with(|| {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys
    });
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let components = Components::new_with_refreshed_list();
    let temperatures = components
        .iter()
        .filter_map(|component| component.temperature())
        .filter(|t| t.is_finite())
        .collect::<Vec<_>>();
    let temperature_c = if temperatures.is_empty() {
        None
    } else {
        Some(temperatures.iter().sum::<f32>() / temperatures.len() as f32)
    };

    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .filter(|disk| disk_mount.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len());
    let disk_percent = match disk {
        Some(disk) => percent(
            disk.total_space().saturating_sub(disk.available_space()),
            disk.total_space(),
        ),
        None => {
            warn!("no disk mounted at {}", disk_mount.display());
            0.0
        }
    };

    Usage {
        cpu_percent: sys.global_cpu_usage(),
        memory_percent: percent(sys.used_memory(), sys.total_memory()),
        temperature_c,
        disk_percent,
    }
}

/// `systemctl is-active`; anything but a clean "active" counts as stopped.
async fn service_state(name: &str) -> ServiceState {
    let status = tokio::process::Command::new("systemctl")
        .args(["is-active", "--quiet", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => ServiceState::Running,
        Ok(_) => ServiceState::Stopped,
        Err(e) => {
            warn!("failed to query service {name}: {e}");
            ServiceState::Stopped
        }
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    async fn sample(&self) -> HostReading {
        let system = self.system.clone();
        let disk_mount = self.disk_mount.clone();
        let usage = tokio::task::spawn_blocking(move || read_usage(&system, &disk_mount))
            .await
            .unwrap_or_else(|e| {
                warn!("host usage probe failed: {e}");
                Usage::default()
            });

        let mut services = BTreeMap::new();
        for name in &self.services {
            services.insert(name.clone(), service_state(name).await);
        }

        let mut missing_artifacts = vec![];
        for artifact in &self.artifacts {
            if !tokio::fs::try_exists(artifact).await.unwrap_or(false) {
                missing_artifacts.push(artifact.display().to_string());
            }
        }

        let reading = HostReading {
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            temperature_c: usage.temperature_c,
            disk_percent: usage.disk_percent,
            services,
            missing_artifacts,
        };
        trace!("sampled {reading:?}");
        reading
    }
}
