use std::path::PathBuf;

/// Core error type shared by every process in the bus (dispatcher, channel
/// adapter, approval hook). Adapter-specific failures are mapped into this
/// type at the boundary so the rest of the system can handle failures
/// consistently (user-facing message vs retryable vs fatal).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("queue error: {0}")]
    Queue(String),

    #[error("session store error: {0}")]
    Session(String),

    #[error("approval error: {0}")]
    Approval(String),

    #[error("external error: {0}")]
    External(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
