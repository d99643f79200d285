//! Command executor
//!
//! Turns validated commands into jobs and runs them concurrently. Each job has its own
//! lock; the transitions of one job are published to subscribers in order while that
//! lock is held. Unrelated jobs never wait on each other.
//!
//! The job file is written on the blocking pool after the store lock is released.
//! Snapshots carry a generation, so a slow older write never replaces a newer file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    actions::{ActionRunner, RunRequest, validate_command},
    error::ValidationError,
    jobs::{ClientRecord, Job, JobLog, JobStatus, JobStore, JobUpdate, Snapshot, SnapshotWriter},
    protocol::Command,
};

/// Result of a successful [`CommandExecutor::submit`]
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Job,
    /// The command id was already known; no new job was created
    pub duplicate: bool,
}

struct Inner {
    runner: Arc<dyn ActionRunner>,
    store: std::sync::Mutex<JobStore>,
    writer: Arc<SnapshotWriter>,
    live: std::sync::Mutex<HashMap<String, Arc<Mutex<Job>>>>,
    subscribers: std::sync::Mutex<HashMap<u64, mpsc::UnboundedSender<JobUpdate>>>,
    next_subscriber: AtomicU64,
}

impl Inner {
    fn store(&self) -> std::sync::MutexGuard<'_, JobStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_behind(&self, snapshot: Snapshot) -> JoinHandle<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = writer.write(snapshot) {
                error!("failed to write job file: {e}");
            }
        })
    }

    /// Record `job` and wait until the job file reflects it
    async fn persist(&self, job: &Job) {
        let recorded = self.store().record(job);
        let snapshot = match recorded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("failed to persist job {}: {e}", job.id);
                return;
            }
        };
        if let Err(e) = self.write_behind(snapshot).await {
            error!("job file writer aborted: {e}");
        }
    }

    fn publish(&self, update: JobUpdate) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|_, sender| sender.send(update.clone()).is_ok());
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Handle to the executor. Cheap to clone.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<Inner>,
}

impl CommandExecutor {
    pub fn new(runner: Arc<dyn ActionRunner>, store: JobStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                writer: store.writer(),
                store: std::sync::Mutex::new(store),
                live: std::sync::Mutex::new(HashMap::new()),
                subscribers: std::sync::Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Validate `command` and, if it passes, start a job for it.
    ///
    /// A command id seen before returns the existing job instead of a new one.
    #[instrument(skip_all, fields(command = %command.id, action = %command.action))]
    pub fn submit(&self, command: &Command) -> Result<Submission, ValidationError> {
        let validated = validate_command(command)?;

        let (job, snapshot) = {
            let mut store = self.inner.store();
            if let Some(existing) = store.find_by_command(&validated.command_id) {
                debug!("command already known as job {}", existing.id);
                return Ok(Submission {
                    job: self.current(existing),
                    duplicate: true,
                });
            }

            let job = Job::new(&validated);
            let snapshot = store
                .record(&job)
                .inspect_err(|e| error!("failed to persist job {}: {e}", job.id))
                .ok();
            (job, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.inner.write_behind(snapshot);
        }

        info!("accepted as job {}", job.id);
        let shared = Arc::new(Mutex::new(job.clone()));
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), shared.clone());
        self.inner.publish(job.update());

        tokio::spawn(execute(self.inner.clone(), shared));

        Ok(Submission {
            job,
            duplicate: false,
        })
    }

    // live copy if the job is still running, the stored record otherwise
    fn current(&self, stored: &Job) -> Job {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stored.id)
            .and_then(|job| job.try_lock().ok().map(|job| job.clone()))
            .unwrap_or_else(|| stored.clone())
    }

    /// Receive every transition published from now on.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        Subscription {
            id,
            inner: self.inner.clone(),
            receiver: rx,
        }
    }

    pub async fn job(&self, id: &str) -> Option<Job> {
        let live = self
            .inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        if let Some(job) = live {
            return Some(job.lock().await.clone());
        }
        self.inner
            .store()
            .jobs()
            .iter()
            .find(|job| job.id == id)
            .cloned()
    }

    /// All retained jobs, oldest first
    pub async fn jobs(&self) -> Vec<Job> {
        let stored = self.inner.store().jobs().to_vec();
        let mut jobs = Vec::with_capacity(stored.len());
        for job in stored {
            match self.job(&job.id).await {
                Some(current) => jobs.push(current),
                None => jobs.push(job),
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn clients(&self) -> Vec<ClientRecord> {
        self.inner.store().clients().to_vec()
    }

    /// Drop all finished jobs. Returns how many were removed.
    pub fn reset(&self) -> std::io::Result<usize> {
        let removed = self.inner.store().reset()?;
        info!("reset removed {removed} finished job(s)");
        Ok(removed)
    }
}

#[instrument(skip_all)]
async fn execute(inner: Arc<Inner>, shared: Arc<Mutex<Job>>) {
    let (id, action, parameters) = {
        let mut job = shared.lock().await;
        let action = job.action;
        job.transition(JobStatus::Running, format!("running {action}"));
        inner.persist(&job).await;
        inner.publish(job.update());
        (job.id.clone(), action, job.parameters.clone())
    };

    let clients = inner.store().clients().to_vec();
    let runner = inner.runner.clone();
    let log = JobLog::new(shared.clone());

    // a panicking runner must still produce a terminal state
    let outcome = tokio::spawn(async move {
        runner
            .run(
                RunRequest {
                    action,
                    parameters: &parameters,
                    clients: &clients,
                },
                &log,
            )
            .await
    })
    .await;

    let mut job = shared.lock().await;
    match outcome {
        Ok(Ok(summary)) => {
            job.summary = Some(summary.clone());
            job.transition(JobStatus::Succeeded, format!("succeeded: {summary}"));
            info!("job {id} succeeded");
        }
        Ok(Err(e)) => {
            let reason = format!("{e:#}");
            job.summary = Some(reason.clone());
            job.transition(JobStatus::Failed, format!("failed: {reason}"));
            warn!("job {id} failed: {reason}");
        }
        Err(e) => {
            job.summary = Some("action runner aborted".to_string());
            job.transition(JobStatus::Failed, format!("failed: action runner aborted: {e}"));
            error!("job {id} runner aborted: {e}");
        }
    }
    inner.persist(&job).await;
    inner.publish(job.update());

    inner
        .live
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

/// Registration for job updates. Dropping it (or calling
/// [`unsubscribe`](Subscription::unsubscribe)) stops delivery.
pub struct Subscription {
    id: u64,
    inner: Arc<Inner>,
    receiver: mpsc::UnboundedReceiver<JobUpdate>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<JobUpdate> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.unsubscribe(self.id);
        self.receiver.close();
    }
}
