//! Error types for marketsync.

use thiserror::Error;

/// The main error type for marketsync.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors (file-backed storage, config files, probes).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket protocol errors from the feed transport.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Key-value store failures.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Feed transport errors (connect refused, stream closed, send failed).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A pending operation could not be executed.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Invalid input or state
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic application error
    #[error("{0}")]
    Application(String),
}

/// Alias for Result with our Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a new invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new application error.
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// Check if this error is recoverable (the caller can retry later).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::WebSocket(_)
                | Self::Transport(_)
                | Self::Execution(_)
                | Self::Storage(_)
        )
    }
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::transport("refused").is_recoverable());
        assert!(Error::execution("503").is_recoverable());
        assert!(!Error::config("bad url").is_recoverable());
        assert!(!Error::invalid_input("empty symbol").is_recoverable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::storage("disk full");
        assert_eq!(err.to_string(), "Storage error: disk full");
    }
}
