//! Error types for the engine adapters.

use thiserror::Error;

/// Main error type for adapter operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The adapter (or its backend process) is not running
    #[error("Engine not running: {0}")]
    NotRunning(String),

    /// Transport errors (child exited, stream closed, HTTP failure)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol errors (malformed or unexpected backend messages)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error returned by the backend
    #[error("Backend error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// An RPC or prompt exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Unknown session, message, or permission id
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend does not support the requested operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, EngineError>;
