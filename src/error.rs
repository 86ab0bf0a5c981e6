use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("SAFETY: {0}")]
    SafetyRejection(String),
    #[error("Framing error: {0}")]
    Framing(String),
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("{field}: {source}")]
    PartialResult {
        field: String,
        source: Box<ScopeError>,
    },
    #[error("Instrument not connected")]
    NotConnected,
    #[error("Worker busy, {0} request dropped")]
    Busy(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("File error: {context}: {source}")]
    File {
        source: std::io::Error,
        context: String,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Machine-checkable classification carried by error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    SafetyRejection,
    Framing,
    PartialResult,
    Decode,
    State,
    File,
}

impl ScopeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScopeError::Io { .. } | ScopeError::Timeout(_) | ScopeError::Protocol(_) => {
                ErrorKind::Transport
            }
            ScopeError::SafetyRejection(_) => ErrorKind::SafetyRejection,
            ScopeError::Framing(_) => ErrorKind::Framing,
            ScopeError::Decode(_) => ErrorKind::Decode,
            ScopeError::PartialResult { .. } => ErrorKind::PartialResult,
            ScopeError::NotConnected
            | ScopeError::Busy(_)
            | ScopeError::InvalidAddress(_)
            | ScopeError::InvalidCommand(_) => ErrorKind::State,
            ScopeError::File { .. } | ScopeError::Config(_) | ScopeError::Json(_) => {
                ErrorKind::File
            }
        }
    }

    /// True when the link can no longer be trusted and the session must go.
    ///
    /// A partial result never tears the session down, even when the failed
    /// field was a transport fault.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Wrap an I/O failure on the instrument link, folding timeouts into
    /// [`ScopeError::Timeout`].
    pub fn link(source: std::io::Error, context: impl Into<String>) -> Self {
        let context = context.into();
        match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ScopeError::Timeout(context)
            }
            _ => ScopeError::Io { source, context },
        }
    }

    pub fn partial(field: impl Into<String>, source: ScopeError) -> Self {
        ScopeError::PartialResult {
            field: field.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_transport_errors() {
        let err = ScopeError::link(
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"),
            "Reading response",
        );
        assert!(matches!(err, ScopeError::Timeout(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn test_partial_result_is_not_fatal() {
        let err = ScopeError::partial("C1:VOLT_DIV", ScopeError::Timeout("query".into()));
        assert_eq!(err.kind(), ErrorKind::PartialResult);
        assert!(!err.is_transport());
        assert!(err.to_string().starts_with("C1:VOLT_DIV"));
    }

    #[test]
    fn test_safety_message_is_distinct() {
        let err = ScopeError::SafetyRejection("C1 in 50 Ohm".into());
        assert_eq!(err.kind(), ErrorKind::SafetyRejection);
        assert!(err.to_string().contains("SAFETY"));
    }
}
