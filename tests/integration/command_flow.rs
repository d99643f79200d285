//! Integration tests for remote commands executed as jobs
//!
//! - Concurrent commands for the same action run as independent jobs
//! - Job history survives an agent restart

use pretty_assertions::assert_eq;
use venue_fleet::{
    jobs::{JobStatus, JobStore},
    protocol::Command,
};

use crate::helpers::*;

#[tokio::test]
async fn test_concurrent_builds_run_as_separate_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let executor = create_test_executor(dir.path());
    let mut subscription = executor.subscribe();

    let first = executor.submit(&Command::new("build:central")).unwrap();
    let second = executor.submit(&Command::new("build:central")).unwrap();
    assert_ne!(first.job.id, second.job.id);

    let updates = collect_until_terminal(&mut subscription, 2).await;

    for job_id in [&first.job.id, &second.job.id] {
        assert_eq!(
            statuses_for(&updates, job_id),
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Succeeded]
        );
    }

    let jobs = executor.jobs().await;
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Succeeded));
}

#[tokio::test]
async fn test_job_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let command = Command::new("sync-clients").with_parameter("target", "lobby");

    {
        let executor = create_test_executor(dir.path());
        let mut subscription = executor.subscribe();
        executor.submit(&command).unwrap();
        collect_until_terminal(&mut subscription, 1).await;
    }

    let store = JobStore::open(dir.path().join("jobs.json")).unwrap();
    let job = store.find_by_command(&command.id).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.parameters.get("target").map(String::as_str), Some("lobby"));

    // a redelivered command after restart is answered from history
    let executor = create_test_executor(dir.path());
    let submission = executor.submit(&command).unwrap();
    assert!(submission.duplicate);
    assert_eq!(submission.job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_invalid_parameters_never_become_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let executor = create_test_executor(dir.path());

    let command = Command::new("deploy-raspberry").with_parameter("bad key!", "x");

    assert!(executor.submit(&command).is_err());
    assert!(executor.jobs().await.is_empty());
}
