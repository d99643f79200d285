//! The closed set of remote actions and how they are carried out
//!
//! Commands arrive with a free-form action string; only [`validate_command`] turns that
//! string into an [`Action`]. Anything outside the enum never reaches a runner.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, instrument};

use crate::{
    config::HookConfig,
    error::ValidationError,
    jobs::{ClientRecord, JobLog},
    protocol::Command,
};

pub const MAX_PARAMETERS: usize = 32;

pub const MAX_PARAMETER_LEN: usize = 1024;

static PARAMETER_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("parameter key pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    BuildCentral,
    BuildRaspberry,
    DeployRaspberry,
    RunFullTests,
    SyncClients,
    RestartMaintenance,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::BuildCentral,
        Action::BuildRaspberry,
        Action::DeployRaspberry,
        Action::RunFullTests,
        Action::SyncClients,
        Action::RestartMaintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BuildCentral => "build-central",
            Action::BuildRaspberry => "build-raspberry",
            Action::DeployRaspberry => "deploy-raspberry",
            Action::RunFullTests => "run-full-tests",
            Action::SyncClients => "sync-clients",
            Action::RestartMaintenance => "restart-maintenance",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    /// Accepts `build-central` as well as the `build:central` spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(':', "-");
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownAction(s.to_string()))
    }
}

/// A command that passed validation and may become a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub command_id: String,
    pub action: Action,
    pub parameters: BTreeMap<String, String>,
    pub requested_by: Option<String>,
}

pub fn validate_command(command: &Command) -> Result<ValidatedCommand, ValidationError> {
    let action = command.action.parse::<Action>()?;

    if command.parameters.len() > MAX_PARAMETERS {
        return Err(ValidationError::TooManyParameters {
            count: command.parameters.len(),
            limit: MAX_PARAMETERS,
        });
    }

    for (key, value) in &command.parameters {
        if !PARAMETER_KEY.is_match(key) {
            return Err(ValidationError::InvalidParameterKey(key.clone()));
        }
        if value.len() > MAX_PARAMETER_LEN {
            return Err(ValidationError::ParameterTooLong {
                key: key.clone(),
                len: value.len(),
                limit: MAX_PARAMETER_LEN,
            });
        }
    }

    Ok(ValidatedCommand {
        command_id: command.id.clone(),
        action,
        parameters: command.parameters.clone(),
        requested_by: command.requested_by.clone(),
    })
}

/// Everything a runner gets to know about the job it executes
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub action: Action,
    pub parameters: &'a BTreeMap<String, String>,
    pub clients: &'a [ClientRecord],
}

/// Carries out an accepted action.
///
/// `Ok` carries the job summary, `Err` the failure reason. Progress goes to the job log.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, request: RunRequest<'_>, log: &JobLog) -> anyhow::Result<String>;
}

/// Stand-in runner: two fixed steps, then success.
#[derive(Debug, Clone)]
pub struct SimulatedRunner {
    step: Duration,
}

impl SimulatedRunner {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }
}

#[async_trait]
impl ActionRunner for SimulatedRunner {
    async fn run(&self, request: RunRequest<'_>, log: &JobLog) -> anyhow::Result<String> {
        log.append(format!("preparing {}", request.action)).await;
        tokio::time::sleep(self.step).await;
        log.append(format!("executing {}", request.action)).await;
        tokio::time::sleep(self.step).await;
        Ok(format!("{} completed", request.action))
    }
}

/// Runs a configured external program per action.
///
/// Parameters are passed as `VENUE_PARAM_<KEY>` environment variables; `sync-clients` also
/// receives the known clients as `VENUE_CLIENTS` (comma separated `name=address`).
#[derive(Debug, Clone, Default)]
pub struct HookRunner {
    hooks: HashMap<Action, HookConfig>,
}

impl HookRunner {
    pub fn new(hooks: impl IntoIterator<Item = (Action, HookConfig)>) -> Self {
        Self {
            hooks: hooks.into_iter().collect(),
        }
    }
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

#[async_trait]
impl ActionRunner for HookRunner {
    #[instrument(skip_all, fields(action = %request.action))]
    async fn run(&self, request: RunRequest<'_>, log: &JobLog) -> anyhow::Result<String> {
        let Some(hook) = self.hooks.get(&request.action) else {
            anyhow::bail!("no hook configured for {}", request.action);
        };

        let mut command = tokio::process::Command::new(&hook.program);
        command
            .args(&hook.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &hook.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in request.parameters {
            command.env(format!("VENUE_PARAM_{}", env_key(key)), value);
        }
        if request.action == Action::SyncClients {
            let clients = request
                .clients
                .iter()
                .map(|client| format!("{}={}", client.name, client.address))
                .collect::<Vec<_>>()
                .join(",");
            command.env("VENUE_CLIENTS", clients);
        }

        debug!("spawning hook {}", hook.program);
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", hook.program))?;

        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut stderr = child.stderr.take().map(|err| BufReader::new(err).lines());

        loop {
            tokio::select! {
                line = async { stdout.as_mut()?.next_line().await.ok().flatten() }, if stdout.is_some() => {
                    match line {
                        Some(line) => log.append(line).await,
                        None => stdout = None,
                    }
                }
                line = async { stderr.as_mut()?.next_line().await.ok().flatten() }, if stderr.is_some() => {
                    match line {
                        Some(line) => log.append(format!("stderr: {line}")).await,
                        None => stderr = None,
                    }
                }
                else => break,
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait for {}", hook.program))?;

        if status.success() {
            Ok(format!("{} finished via {}", request.action, hook.program))
        } else {
            anyhow::bail!("{} exited with {status}", hook.program)
        }
    }
}
