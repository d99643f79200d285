//! Error types for the fleet core
//!
//! Transport and probe failures are absorbed by the owning loop (retry or degrade);
//! validation and rebuild failures are surfaced to whoever asked.

use std::path::PathBuf;

use thiserror::Error;

use crate::phase::Phase;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The registry rejected the credentials
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("no handshake response within {timeout_secs}s")]
    HandshakeTimeout { timeout_secs: u64 },

    #[error("could not reach registry within {timeout_secs}s")]
    ConnectTimeout { timeout_secs: u64 },

    #[error("no traffic from registry for {idle_secs}s")]
    Unresponsive { idle_secs: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The peer sent something that does not fit the protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("device identity unavailable: {0}")]
    Identity(#[from] IdentityError),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed identity file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write identity: {0}")]
    Write(#[from] std::io::Error),

    #[error("identity is missing its {0}")]
    Incomplete(&'static str),
}

/// Rejection of a command before any job exists
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid parameter key: {0:?}")]
    InvalidParameterKey(String),

    #[error("parameter {key} is {len} bytes, limit is {limit}")]
    ParameterTooLong {
        key: String,
        len: usize,
        limit: usize,
    },

    #[error("{count} parameters given, limit is {limit}")]
    TooManyParameters { count: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum PlaylistError {
    /// Nothing in the configuration resolved to an existing file
    #[error("no media resolved for phase {phase}")]
    NoMedia { phase: Phase },

    #[error("content configuration unusable: {0}")]
    Content(String),

    #[error("failed to write playlist: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("failed to persist phase: {0}")]
    Persist(#[from] std::io::Error),

    #[error("unknown phase: {0:?}")]
    Unknown(String),

    #[error(transparent)]
    Rebuild(#[from] PlaylistError),
}
