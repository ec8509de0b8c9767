use thiserror::Error;

use crate::protocol::RpcError;

/// Failures surfaced to callers of the worker channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Worker not started")]
    NotStarted,

    #[error("Too many pending calls (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("Call {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Worker restart gave up after {attempts} attempts: {last_failure}")]
    RestartExhausted { attempts: u32, last_failure: String },

    #[error("Channel stopped")]
    Stopped,

    #[error("Worker failed to start: {0}")]
    StartFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker error {code}: {message}")]
    Remote {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ChannelError {
    /// Transport and availability failures: the request may not have been
    /// executed and is worth retrying later.
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            ChannelError::NotStarted
                | ChannelError::CapacityExceeded { .. }
                | ChannelError::Timeout { .. }
                | ChannelError::WorkerCrashed(_)
                | ChannelError::RestartExhausted { .. }
                | ChannelError::Stopped
                | ChannelError::StartFailed(_)
                | ChannelError::Transport(_)
        )
    }
}

impl From<RpcError> for ChannelError {
    fn from(e: RpcError) -> Self {
        ChannelError::Remote {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failures inside the worker's storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StorageError {
    /// Wire error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::InvalidParams(_) => "invalid_params",
            StorageError::UnknownMethod(_) => "unknown_method",
            StorageError::Io(_) | StorageError::Serialization(_) | StorageError::Database(_) => {
                "storage_error"
            }
        }
    }
}

impl From<StorageError> for RpcError {
    fn from(e: StorageError) -> Self {
        RpcError::new(e.code(), e.to_string())
    }
}
