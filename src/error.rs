//! Error types for agent-hive.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Workspace precondition violated: {0}")]
    Precondition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task store and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Task {id} already claimed by another agent")]
    AlreadyClaimed { id: String },

    #[error("Task file {path} is gone (moved by another agent)")]
    AlreadyGone { path: PathBuf },

    #[error("Cannot transition task from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task id {id} already exists")]
    DuplicateId { id: String },

    #[error("Unreadable task file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Another worker won the race for this file. Expected, never fatal.
    pub fn is_race_lost(&self) -> bool {
        matches!(self, Self::AlreadyClaimed { .. } | Self::AlreadyGone { .. })
    }

    /// The file may be readable on a later poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Corrupt { .. }) || self.is_race_lost()
    }
}

/// Capability execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Task carries no executable request")]
    NoRequest,

    #[error("Invalid capability request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Operation {op} timed out after {timeout:?}")]
    Timeout { op: String, timeout: Duration },

    #[error("Operation {op} failed: {reason}")]
    Failed { op: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Admission and validation oracle errors.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Oracle {oracle} unavailable: {reason}")]
    Unavailable { oracle: String, reason: String },

    #[error("Invalid response from {oracle}: {reason}")]
    InvalidResponse { oracle: String, reason: String },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
