use thiserror::Error;

use crate::stage::{Stage, StageEvent};

/// Main error type for Sweeper
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Sweep error: {0}")]
    Sweep(#[from] SweepError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Command-level sweep errors, surfaced to the client that issued the command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SweepError {
    #[error("Sweep not found: {sweep_id}")]
    NotFound { sweep_id: String },

    #[error("Sweep already exists: {sweep_id}")]
    Duplicate { sweep_id: String },

    #[error("Invalid sweep configuration: {message}")]
    InvalidConfig { message: String },
}

/// Protocol violations of the trial stage machine
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageError {
    #[error("Illegal transition: {event} from stage {from}")]
    IllegalTransition { from: Stage, event: StageEvent },
}

/// Failures reported by a worker launcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Launch rejected: {reason}")]
    Rejected { reason: String },

    #[error("Launcher unavailable: {message}")]
    Unavailable { message: String },

    #[error("Unknown worker: {worker}")]
    UnknownWorker { worker: String },

    #[error("Worker IO error: {message}")]
    Io { message: String },
}

/// Record store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record IO error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// Result type alias for Sweeper operations
pub type SwResult<T> = Result<T, SwError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::SwError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SwError::Config(format!($($arg)*))
    };
}
