//! Error taxonomy shared across the codec, server client, and sync engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by flowsync operations.
///
/// Severity is decided by the caller: per-node codec failures degrade to an
/// unstable flag and a warning, poll failures retry with backoff, and only
/// construction/startup errors are fatal to the process.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("deploy conflict: {0}")]
    Conflict(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("extractor {name}: {reason}")]
    Extractor { name: String, reason: String },

    #[error("round-trip verification failed for node {0}")]
    Verification(String),

    #[error("path escapes the source tree: {0}")]
    PathEscape(PathBuf),

    #[error("invalid flows document: {0}")]
    InvalidDocument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Classify a transport error from the HTTP client.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Connection(format!("request timed out: {err}"))
        } else if err.is_connect() {
            SyncError::Connection(err.to_string())
        } else {
            SyncError::Server(err.to_string())
        }
    }
}
