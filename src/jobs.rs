//! Jobs and their on-disk record
//!
//! A job is created the moment a command passes validation and only ever moves forward:
//! `queued -> running -> succeeded | failed`. Logs are append-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    actions::{Action, ValidatedCommand},
    util::write_atomic,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Forward-only transitions. `queued -> failed` covers jobs interrupted by a restart.
    pub fn can_transition(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub command_id: String,
    pub action: Action,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub logs: Vec<LogLine>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Job {
    pub fn new(command: &ValidatedCommand) -> Self {
        let now = Utc::now();
        let mut job = Self {
            id: uuid::Uuid::new_v4().to_string(),
            command_id: command.command_id.clone(),
            action: command.action,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            logs: vec![],
            parameters: command.parameters.clone(),
            requested_by: command.requested_by.clone(),
            summary: None,
        };
        job.log(format!("queued {}", command.action));
        job
    }

    // clocks can step backwards, job timestamps must not
    fn now(&self) -> DateTime<Utc> {
        Utc::now().max(self.updated_at)
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let at = self.now();
        self.logs.push(LogLine {
            at,
            line: line.into(),
        });
    }

    /// Move to `next` and record why. Returns `false` (and changes nothing) for a backwards
    /// or repeated transition.
    pub fn transition(&mut self, next: JobStatus, line: impl Into<String>) -> bool {
        if !self.status.can_transition(next) {
            warn!(
                "refusing job {} transition {:?} -> {next:?}",
                self.id, self.status
            );
            return false;
        }
        self.status = next;
        self.updated_at = self.now();
        self.log(line);
        true
    }

    pub fn update(&self) -> JobUpdate {
        JobUpdate {
            job_id: self.id.clone(),
            command_id: self.command_id.clone(),
            action: self.action,
            status: self.status,
            timestamp: self.updated_at,
            summary: self.summary.clone(),
        }
    }
}

/// A status transition as seen by subscribers and the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: String,
    pub command_id: String,
    pub action: Action,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Append-only view of a running job handed to action runners
#[derive(Debug, Clone)]
pub struct JobLog {
    job: Arc<Mutex<Job>>,
}

impl JobLog {
    pub fn new(job: Arc<Mutex<Job>>) -> Self {
        Self { job }
    }

    pub async fn append(&self, line: impl Into<String>) {
        let line = line.into();
        let mut job = self.job.lock().await;
        debug!("job {}: {line}", job.id);
        job.log(line);
    }

    pub async fn lines(&self) -> Vec<String> {
        self.job
            .lock()
            .await
            .logs
            .iter()
            .map(|log| log.line.clone())
            .collect()
    }
}

/// A device the `sync-clients` action distributes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub name: String,
    pub address: String,
}

/// Content of the job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsState {
    #[serde(default)]
    pub jobs: Vec<Job>,

    #[serde(default)]
    pub clients: Vec<ClientRecord>,

    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
}

impl Default for OpsState {
    fn default() -> Self {
        Self {
            jobs: vec![],
            clients: vec![],
            max_jobs: default_max_jobs(),
        }
    }
}

fn default_max_jobs() -> usize {
    100
}

/// Serialized job file taken under the store lock and written once it is released
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    generation: u64,
    content: Vec<u8>,
}

/// Writes snapshots of one store in generation order
#[derive(Debug, Default)]
pub struct SnapshotWriter {
    written: std::sync::Mutex<u64>,
}

impl SnapshotWriter {
    /// Returns `false` and leaves the file alone when a newer snapshot was already written.
    pub fn write(&self, snapshot: Snapshot) -> std::io::Result<bool> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if snapshot.generation <= *written {
            debug!("skipping stale job snapshot {}", snapshot.generation);
            return Ok(false);
        }
        write_atomic(&snapshot.path, &snapshot.content)?;
        *written = snapshot.generation;
        Ok(true)
    }
}

/// The job file and its in-memory copy.
///
/// [`upsert`](JobStore::upsert) writes through. [`record`](JobStore::record) only
/// updates memory and hands back a [`Snapshot`] for the shared [`SnapshotWriter`].
#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    state: OpsState,
    generation: u64,
    writer: Arc<SnapshotWriter>,
}

impl JobStore {
    /// Load the job file, creating it with defaults when absent.
    ///
    /// Jobs that were still queued or running belong to a previous process and are failed.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (state, existed) = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let state: OpsState = serde_json::from_str(&content)
                    .with_context(|| format!("malformed job file: {}", path.display()))?;
                (state, true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (OpsState::default(), false),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let mut store = Self {
            path,
            state,
            generation: 0,
            writer: Arc::default(),
        };
        let interrupted = store.fail_interrupted();
        if interrupted > 0 {
            info!("marked {interrupted} interrupted job(s) as failed");
        }
        if !existed || interrupted > 0 {
            store
                .save()
                .with_context(|| format!("failed to write {}", store.path.display()))?;
        }
        Ok(store)
    }

    fn fail_interrupted(&mut self) -> usize {
        let mut count = 0;
        for job in self.state.jobs.iter_mut().filter(|job| !job.status.is_terminal()) {
            job.summary = Some("interrupted by agent restart".to_string());
            job.transition(JobStatus::Failed, "interrupted by agent restart");
            count += 1;
        }
        count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn jobs(&self) -> &[Job] {
        &self.state.jobs
    }

    pub fn clients(&self) -> &[ClientRecord] {
        &self.state.clients
    }

    pub fn writer(&self) -> Arc<SnapshotWriter> {
        self.writer.clone()
    }

    pub fn max_jobs(&self) -> usize {
        self.state.max_jobs
    }

    pub fn find_by_command(&self, command_id: &str) -> Option<&Job> {
        self.state
            .jobs
            .iter()
            .find(|job| job.command_id == command_id)
    }

    /// Insert or replace a job record, prune, persist.
    pub fn upsert(&mut self, job: &Job) -> std::io::Result<()> {
        let snapshot = self.record(job)?;
        self.writer.write(snapshot).map(drop)
    }

    /// Insert or replace a job record and prune without touching the disk.
    pub fn record(&mut self, job: &Job) -> std::io::Result<Snapshot> {
        match self.state.jobs.iter_mut().find(|stored| stored.id == job.id) {
            Some(stored) => *stored = job.clone(),
            None => self.state.jobs.push(job.clone()),
        }
        self.prune();
        self.snapshot()
    }

    // oldest terminal jobs go first; unfinished jobs are never pruned
    fn prune(&mut self) {
        let max = self.state.max_jobs.max(1);
        while self.state.jobs.len() > max {
            let oldest = self
                .state
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.status.is_terminal())
                .min_by_key(|(_, job)| job.created_at)
                .map(|(index, _)| index);

            match oldest {
                Some(index) => {
                    let removed = self.state.jobs.remove(index);
                    debug!("pruned job {}", removed.id);
                }
                None => break,
            }
        }
    }

    /// Drop every finished job. Returns how many were removed.
    pub fn reset(&mut self) -> std::io::Result<usize> {
        let before = self.state.jobs.len();
        self.state.jobs.retain(|job| !job.status.is_terminal());
        let removed = before - self.state.jobs.len();
        self.save()?;
        Ok(removed)
    }

    fn snapshot(&mut self) -> std::io::Result<Snapshot> {
        let content = serde_json::to_vec_pretty(&self.state).map_err(std::io::Error::other)?;
        self.generation += 1;
        Ok(Snapshot {
            path: self.path.clone(),
            generation: self.generation,
            content,
        })
    }

    fn save(&mut self) -> std::io::Result<()> {
        let snapshot = self.snapshot()?;
        self.writer.write(snapshot).map(drop)
    }
}
