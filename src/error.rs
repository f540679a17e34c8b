//! Error types for Convo

use thiserror::Error;

/// Result type alias for Convo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Convo
#[derive(Error, Debug)]
pub enum Error {
    #[error("No inference endpoint is available")]
    ConnectionUnavailable,

    #[error("Stream decode error: {0}")]
    Decode(String),

    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Compression invariant violated: {0}")]
    CompressionInvariant(String),

    #[error("Conversation {0} already has a stream in flight")]
    StreamInFlight(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error aborts a send outright instead of being recorded
    /// in the conversation.
    pub fn is_fatal_for_send(&self) -> bool {
        matches!(
            self,
            Error::ConnectionUnavailable
                | Error::Transport(_)
                | Error::Http(_)
                | Error::StreamInFlight(_)
                | Error::CompressionInvariant(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
