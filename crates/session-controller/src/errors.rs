//! Session Controller error types.
//!
//! Two families:
//! - [`ScError`] is returned by handle operations (`join`, `leave`, ...).
//! - [`SessionFailure`] is the cause attached to a session that entered
//!   the terminal `Failed` state. It is cloneable so it can ride along in
//!   state snapshots and notifications.
//!
//! Gateway details are logged by the actor; `client_message()` returns text
//! that is safe to show in the presentation layer.

use common::error::GatewayError;
use thiserror::Error;

/// Session Controller error type.
#[derive(Debug, Error)]
pub enum ScError {
    /// Operation not permitted in the current session state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Operation requires a joined session.
    #[error("Session has not joined a room")]
    NotJoined,

    /// The peer is not known to this session.
    #[error("Unknown peer: {0}")]
    UnknownPeer(u64),

    /// A gateway call failed.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Actor mailbox or reply channel failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScError {
    /// Returns a presentation-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ScError::InvalidState { operation, state } => {
                format!("Cannot {operation} while the session is {state}")
            }
            ScError::NotJoined => "Join a room first".to_string(),
            ScError::UnknownPeer(_) => "Participant is no longer in the room".to_string(),
            ScError::Gateway(_) => "The video service reported an error".to_string(),
            ScError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether the error means the session can no longer be used.
    ///
    /// A closed actor mailbox is fatal; everything else leaves the session
    /// usable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScError::Internal(_))
    }
}

/// Cause attached to a session in the `Failed` state.
///
/// Every variant is non-transient: the session does not retry on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    /// The signaling connection could not be established.
    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),

    /// The publish handle could not be attached.
    #[error("Attach failed: {0}")]
    AttachFailed(String),

    /// The room rejected the join request.
    #[error("Join rejected ({code}): {reason}")]
    JoinRejected { code: u32, reason: String },

    /// The join request could not be delivered.
    #[error("Join request failed: {0}")]
    JoinRequestFailed(String),

    /// No join confirmation arrived within the configured timeout.
    #[error("Join timed out")]
    JoinTimedOut,
}

impl SessionFailure {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionFailure::GatewayUnreachable(_) => "gateway_unreachable",
            SessionFailure::AttachFailed(_) => "attach_failed",
            SessionFailure::JoinRejected { .. } => "join_rejected",
            SessionFailure::JoinRequestFailed(_) => "join_request_failed",
            SessionFailure::JoinTimedOut => "join_timed_out",
        }
    }
}
