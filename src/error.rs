//! Error types for the AMI client

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors surfaced by the AMI client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// TCP I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation did not complete in time
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Login was rejected or credentials are missing
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// No live session (never connected, or [`Manager::close`](crate::Manager::close) was called)
    #[error("not connected")]
    NotConnected,

    /// The session ended while an action was outstanding, and the action was
    /// not eligible for replay (forgetable, or already partially answered)
    #[error("connection closed")]
    ConnectionClosed,

    /// Wire-level violation that cannot be degraded to a decoded block
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// An action field would break line-oriented framing
    #[error("{context} must not contain newlines")]
    InvalidField { context: String },

    /// An event glob did not compile
    #[error("invalid event pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    /// TLS was requested but could not be configured
    #[error("TLS configuration error: {message}")]
    TlsConfig { message: String },
}

impl AmiError {
    /// Create a protocol error with a message.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::Protocol {
            message: message.into(),
        }
    }

    /// Create an authentication failure with a reason.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        AmiError::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    /// Create a TLS configuration error with a message.
    pub fn tls_config(message: impl Into<String>) -> Self {
        AmiError::TlsConfig {
            message: message.into(),
        }
    }
}
