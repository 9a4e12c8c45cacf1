//! Communication error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by communicators and the services orchestrator
///
/// Every variant that concerns a remote peer names it (address or member name)
/// together with the action that was in progress.
#[derive(Debug, Error)]
pub enum CommError {
    /// Invalid URI, port, hostname, event key, role or callback
    #[error("Configuration error: {0}")]
    Config(String),

    /// No echo (or no event) arrived within the allotted time
    #[error("[{peer}] Timed out after {timeout:?} while {action}")]
    Timeout {
        peer: String,
        action: String,
        timeout: Duration,
    },

    /// The echo returned by the peer differs from the bytes that were sent
    #[error("[{peer}] Unexpected response while {action}: expected {expected:?}, got {received:?}")]
    Mismatch {
        peer: String,
        action: String,
        expected: String,
        received: String,
    },

    /// A pending wait was cancelled because the communicator was closed
    #[error("[{peer}] Cancelled while {action}: communicator closed")]
    Cancelled { peer: String, action: String },

    /// The communicator is closed and cannot take new requests
    #[error("[{peer}] Communicator is closed")]
    Closed { peer: String },

    /// Socket-level failure or unexpected socket kind
    #[error("[{peer}] Transport error: {message}")]
    Transport { peer: String, message: String },

    /// One or more services failed to report an event within the shared budget
    #[error("The following services failed to respond to {event} in time: {}", missing.join(", "))]
    ServicesTimeout { event: String, missing: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result alias used throughout the crate
pub type CommResult<T> = Result<T, CommError>;

impl CommError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        CommError::Config(message.into())
    }

    /// Shorthand for a transport error
    pub fn transport(peer: impl Into<String>, message: impl Into<String>) -> Self {
        CommError::Transport {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, CommError::Config(_))
    }

    /// Check if this is a timeout (single peer or services-wide)
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommError::Timeout { .. } | CommError::ServicesTimeout { .. })
    }

    /// Check if this error leaves the communicator closed
    ///
    /// A failed confirmed delivery is never retried in place; the caller has to
    /// build a new communicator. A services timeout closes the members it names.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            CommError::Timeout { .. }
            | CommError::Mismatch { .. }
            | CommError::Cancelled { .. }
            | CommError::Closed { .. }
            | CommError::Transport { .. }
            | CommError::ServicesTimeout { .. } => true,
            CommError::Config(_)
            | CommError::Io(_)
            | CommError::Json(_)
            | CommError::Http(_) => false,
        }
    }

    /// Names of the services that failed to respond, if this is a services timeout
    pub fn missing_services(&self) -> &[String] {
        match self {
            CommError::ServicesTimeout { missing, .. } => missing,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_peer_and_action() {
        let err = CommError::Timeout {
            peer: "udp://127.0.0.1:1001".to_string(),
            action: "awaiting echo".to_string(),
            timeout: Duration::from_secs(1),
        };

        let msg = err.to_string();
        assert!(msg.contains("udp://127.0.0.1:1001"));
        assert!(msg.contains("awaiting echo"));
        assert!(err.is_timeout());
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_services_timeout_lists_missing() {
        let err = CommError::ServicesTimeout {
            event: "EXPINIT".to_string(),
            missing: vec!["rig2".to_string(), "rig3".to_string()],
        };

        assert_eq!(
            err.to_string(),
            "The following services failed to respond to EXPINIT in time: rig2, rig3"
        );
        assert_eq!(err.missing_services(), ["rig2", "rig3"]);
        assert!(err.is_timeout());
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_config_is_not_fatal() {
        let err = CommError::config("Invalid port number: 0");
        assert!(err.is_config());
        assert!(!err.is_connection_fatal());
        assert!(err.missing_services().is_empty());
    }
}
