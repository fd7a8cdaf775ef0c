//! Error types for the monitor.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while configuring or running a monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Invalid or incomplete configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A file or directory could not be created, opened or written.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A channel failed to subscribe or lost its connection.
    #[error("Connection error on {channel}: {reason}")]
    Connection { channel: String, reason: String },

    /// Writing a record to the sink failed mid-run.
    #[error("Failed to write record: {0}")]
    SinkWrite(#[from] std::io::Error),

    /// A transport call did not complete within its bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// The engine was asked to do something its current state forbids.
    #[error("Invalid engine state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
}

impl MonitorError {
    /// Build an `Io` error for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MonitorError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for errors that must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MonitorError::Configuration(_) | MonitorError::Io { .. } | MonitorError::InvalidState { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mentions_path() {
        let err = MonitorError::io(
            "/readonly/out.csv",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = err.to_string();
        assert!(message.contains("/readonly/out.csv"));
        assert!(message.contains("denied"));
        assert!(err.is_fatal());
    }

    #[test]
    fn connection_and_sink_errors_are_not_fatal() {
        let conn = MonitorError::Connection {
            channel: "TEST:A".to_string(),
            reason: "never connected".to_string(),
        };
        assert!(!conn.is_fatal());

        let sink = MonitorError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(matches!(sink, MonitorError::SinkWrite(_)));
        assert!(!sink.is_fatal());
    }
}
