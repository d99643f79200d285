//! Event phase and the state machine that owns it
//!
//! The phase is persisted before the playlist is rebuilt, so a crash between the two
//! recovers into the new phase with a fresh rebuild on boot.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    content::ContentSource,
    error::{PhaseError, PlaylistError},
    playlist::{PlaylistBuilder, RebuildReport},
    util::write_atomic,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Neutral,
    Before,
    During,
    After,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Neutral => "neutral",
            Phase::Before => "before",
            Phase::During => "during",
            Phase::After => "after",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "neutral" => Ok(Phase::Neutral),
            "before" => Ok(Phase::Before),
            "during" => Ok(Phase::During),
            "after" => Ok(Phase::After),
            _ => Err(PhaseError::Unknown(s.to_string())),
        }
    }
}

/// Plain-text phase file holding a single token
#[derive(Debug, Clone)]
pub struct PhaseStore {
    path: PathBuf,
}

impl PhaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted phase; `neutral` on first boot or when the file is unreadable.
    pub fn load(&self) -> Phase {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => content.parse().unwrap_or_else(|e| {
                warn!("{}: {e}, starting neutral", self.path.display());
                Phase::Neutral
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no phase file yet, starting neutral");
                Phase::Neutral
            }
            Err(e) => {
                warn!("failed to read {}: {e}, starting neutral", self.path.display());
                Phase::Neutral
            }
        }
    }

    pub fn save(&self, phase: Phase) -> std::io::Result<()> {
        write_atomic(&self.path, format!("{phase}\n").as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseChange {
    Unchanged,
    Changed(RebuildReport),
}

/// Single owner of the current phase
#[derive(Debug)]
pub struct PhaseMachine {
    store: PhaseStore,
    builder: PlaylistBuilder,
    content: ContentSource,
    current: Phase,
    rebuilds: u64,
}

impl PhaseMachine {
    /// Restore the persisted phase. Does not rebuild; the caller decides when to.
    pub fn restore(store: PhaseStore, builder: PlaylistBuilder, content: ContentSource) -> Self {
        let current = store.load();
        info!(
            "restored phase {current}, playlist at {}",
            builder.output().display()
        );
        Self {
            store,
            builder,
            content,
            current,
            rebuilds: 0,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Number of rebuild attempts so far
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn set_phase(&mut self, phase: Phase) -> Result<PhaseChange, PhaseError> {
        if phase == self.current {
            debug!("already in phase {phase}");
            return Ok(PhaseChange::Unchanged);
        }

        self.store.save(phase)?;
        info!("phase {} -> {phase}", self.current);
        self.current = phase;

        Ok(PhaseChange::Changed(self.rebuild()?))
    }

    pub fn rebuild(&mut self) -> Result<RebuildReport, PlaylistError> {
        self.rebuilds += 1;
        let content = self.content.load()?;
        self.builder.rebuild(self.current, &content)
    }

    pub fn content_changed(&self) -> bool {
        self.content.changed()
    }
}
