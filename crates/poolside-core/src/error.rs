// ── Core error types ──
//
// User-facing errors from poolside-core. Wire-level detail (framing,
// codec, correlation) is folded into a small set of domain variants by
// the `From<poolside_api::Error>` impl below.

use std::time::Duration;

use thiserror::Error;

/// Unified error type for the core crate.
///
/// `Clone` so one batched write result can be handed to every caller
/// whose changes were folded into it.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to controller at {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Not connected to controller")]
    NotConnected,

    #[error("Connection to controller lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Request errors ───────────────────────────────────────────────
    /// The controller answered with a non-200 response code.
    #[error("{command} rejected by controller (response code {code})")]
    Command { command: String, code: String },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Queue overflow or a request dropped by deadlock recovery.
    #[error("Flow control: {message}")]
    FlowControl { message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Already started")]
    AlreadyStarted,

    #[error("Stopped")]
    Stopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The controller's response code, for [`CoreError::Command`].
    pub fn response_code(&self) -> Option<&str> {
        match self {
            Self::Command { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns `true` if the failure was in reaching the controller at all.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::NotConnected
                | Self::ConnectionLost { .. }
                | Self::Protocol { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<poolside_api::Error> for CoreError {
    fn from(err: poolside_api::Error) -> Self {
        use poolside_api::Error as Api;

        match err {
            Api::ConnectTimeout { addr, timeout } => CoreError::ConnectionFailed {
                addr,
                reason: format!("timed out after {timeout:?}"),
            },
            Api::ConnectRefused { addr } => CoreError::ConnectionFailed {
                addr,
                reason: "connection refused".into(),
            },
            Api::Connect { addr, reason } => CoreError::ConnectionFailed { addr, reason },
            Api::Io(e) => CoreError::ConnectionLost {
                reason: e.to_string(),
            },
            Api::Disconnected => CoreError::NotConnected,
            e @ (Api::FrameTooLarge { .. } | Api::InvalidUtf8 | Api::MalformedMessage { .. }) => {
                CoreError::Protocol {
                    message: e.to_string(),
                }
            }
            Api::Json(e) => CoreError::Internal(format!("request serialization failed: {e}")),
            Api::MalformedResponse { command, reason } => CoreError::InvalidResponse {
                message: format!("{command}: {reason}"),
            },
            Api::Response { command, code } => CoreError::Command { command, code },
            Api::Timeout { command, timeout } => CoreError::Timeout { command, timeout },
            e @ (Api::QueueFull { .. } | Api::RequestAbandoned) => CoreError::FlowControl {
                message: e.to_string(),
            },
        }
    }
}
