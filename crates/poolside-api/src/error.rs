use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the `poolside-api` crate.
///
/// Covers every failure mode of one controller session: establishing the
/// TCP link, framing, per-request failures, and flow control.
/// `poolside-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connect ─────────────────────────────────────────────────────
    /// TCP connect did not complete within the connect timeout.
    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// The controller actively refused the connection.
    #[error("Connection to {addr} refused")]
    ConnectRefused { addr: String },

    /// Any other connect failure (DNS, unreachable network, ...).
    #[error("Cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Socket read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session is closed (or closed while the request was pending).
    #[error("Not connected to controller")]
    Disconnected,

    // ── Framing ─────────────────────────────────────────────────────
    /// Receive buffer grew past the hard cap without a line terminator.
    #[error("Frame exceeds {max} bytes (buffered {size})")]
    FrameTooLarge { size: usize, max: usize },

    /// A complete line was not valid UTF-8.
    #[error("Received line is not valid UTF-8")]
    InvalidUtf8,

    /// Request serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A well-formed JSON message is missing a required field.
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    /// A response body did not have the expected shape.
    #[error("Malformed {command} response: {reason}")]
    MalformedResponse { command: String, reason: String },

    // ── Requests ────────────────────────────────────────────────────
    /// The controller answered with a non-200 response code.
    #[error("{command} failed with response code {code}")]
    Response { command: String, code: String },

    /// No response arrived within the per-request timeout.
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The wait queue is at capacity; the request was never sent.
    #[error("Request queue full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    /// The request was discarded by flow-control deadlock recovery.
    #[error("Request abandoned by flow-control recovery")]
    RequestAbandoned,
}

impl Error {
    /// Returns `true` if this error came from establishing the TCP link.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ConnectRefused { .. } | Self::Connect { .. }
        )
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectTimeout { .. }
            | Self::ConnectRefused { .. }
            | Self::Connect { .. }
            | Self::Timeout { .. }
            | Self::QueueFull { .. }
            | Self::RequestAbandoned
            | Self::Disconnected => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` if the session cannot continue after this error.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::FrameTooLarge { .. } | Self::InvalidUtf8 | Self::Disconnected
        )
    }

    /// The controller's response code, if this is a response error.
    pub fn response_code(&self) -> Option<&str> {
        match self {
            Self::Response { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Returned by a notification handler to force a session resync.
///
/// The connection closes when a handler reports a dispatch failure, so
/// the supervisor reconnects and the model is re-read from scratch.
#[derive(Debug, Clone, Error)]
#[error("Notification dispatch failed: {0}")]
pub struct DispatchError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_are_transient() {
        let err = Error::ConnectRefused {
            addr: "10.0.0.5:6681".into(),
        };
        assert!(err.is_connect_error());
        assert!(err.is_transient());
        assert!(!err.is_fatal_to_connection());
    }

    #[test]
    fn response_error_is_not_fatal() {
        let err = Error::Response {
            command: "SETPARAMLIST".into(),
            code: "400".into(),
        };
        assert_eq!(err.response_code(), Some("400"));
        assert!(!err.is_transient());
        assert!(!err.is_fatal_to_connection());
        assert_eq!(err.to_string(), "SETPARAMLIST failed with response code 400");
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let err = Error::FrameTooLarge {
            size: 1_000_001,
            max: 1_000_000,
        };
        assert!(err.is_fatal_to_connection());
    }
}
