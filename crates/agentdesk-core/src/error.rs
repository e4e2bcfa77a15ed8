//! Error types for `AgentDesk` core library.

use thiserror::Error;

/// Result type alias using `AgentDesk` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `AgentDesk` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// NDJSON parsing error
    #[error("Failed to parse NDJSON: {0}")]
    NdjsonParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Approval rule error (bad pattern, unreadable rule file)
    #[error("Approval rule error: {0}")]
    Rules(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
