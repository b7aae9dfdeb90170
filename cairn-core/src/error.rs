use crate::protocol::{OpCode, Status};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error reading request body source: {0}")]
    Source(std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("file path format error: {0}")]
    InvalidPath(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("server answered {op:?} with status {status:?}")]
    Status { op: OpCode, status: Status },

    #[error("max connections exceeded for server {server}")]
    MaxConnectionsExceeded { server: String },

    #[error("no storage server available")]
    NoStorageAvailable,

    #[error("no tracker server available")]
    NoTrackerAvailable,

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CairnError {
    /// Errors after which the byte stream of a connection can no longer be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            CairnError::Io(_) | CairnError::Json(_) | CairnError::Protocol(_) | CairnError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CairnError>;
