//! Error types for the Chief of Staff daemon.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task queue file errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} is not awaiting approval")]
    NotAwaitingApproval { id: String },

    #[error("Task {id} cannot be stored: {reason}")]
    InvalidTask { id: String, reason: String },

    #[error("Failed to access queue file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Daemon state snapshot errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Agent lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {id} not found")]
    NotFound { id: String },

    #[error("Agent {id} is not running")]
    NotRunning { id: String },

    #[error("Failed to signal agent {id}: {reason}")]
    SignalFailed { id: String, reason: String },

    #[error("Failed to spawn agent for task {task_id}: {reason}")]
    SpawnFailed { task_id: String, reason: String },

    #[error("Failed to write log for agent {id}: {source}")]
    Log {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Process metrics / health check errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Process metrics unavailable: {0}")]
    MetricsUnavailable(String),
}

/// Daemon lifecycle errors. Returned instead of panicking so callers decide
/// whether to surface them.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Daemon is already running")]
    AlreadyRunning,

    #[error("Daemon is not running")]
    NotRunning,

    #[error("Daemon is already paused")]
    AlreadyPaused,

    #[error("Daemon is not paused")]
    NotPaused,

    #[error("Invalid daemon config: {0}")]
    InvalidConfig(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}
