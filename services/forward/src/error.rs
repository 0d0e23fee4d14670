//! Error types for forwarding sessions.

use std::io;

use thiserror::Error;

/// Session errors with standardized reason codes.
///
/// Rate-limit denials and sniffing failures are not errors: the first
/// ends the session silently, the second degrades to an unknown protocol.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No target could be selected for the session.
    #[error("target not available")]
    TargetUnavailable,

    /// The outbound connection could not be established.
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// I/O failed while relaying; EOF never surfaces here.
    #[error("relay: {0}")]
    Relay(#[source] io::Error),

    /// The session token was cancelled before the target was reached.
    #[error("session canceled")]
    Canceled,

    /// Handler metadata holds a value that cannot be used.
    #[error("invalid metadata {key}: {detail}")]
    Metadata { key: String, detail: String },
}

impl HandlerError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            HandlerError::TargetUnavailable => "target_unavailable",
            HandlerError::Dial { .. } => "dial_failed",
            HandlerError::Relay(_) => "relay_failed",
            HandlerError::Canceled => "canceled",
            HandlerError::Metadata { .. } => "invalid_metadata",
        }
    }
}
