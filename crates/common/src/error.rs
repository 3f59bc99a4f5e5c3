//! Common error types for Telecare components.
//!
//! These are the failures reported by the external collaborators: the
//! signaling gateway and the local media-capture device.

use thiserror::Error;

/// Errors reported by the signaling gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The gateway could not be reached or the connection was refused.
    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    /// Attaching to a plugin failed.
    #[error("Attach failed: {0}")]
    Attach(String),

    /// A request could not be delivered.
    #[error("Send failed: {0}")]
    Send(String),

    /// Offer/answer negotiation failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Detaching a handle failed.
    #[error("Detach failed: {0}")]
    Detach(String),

    /// The handle or session has already been released.
    #[error("Handle closed")]
    Closed,
}

/// Errors reported by the media-capture collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The user or platform denied access to the device.
    #[error("Capture permission denied")]
    PermissionDenied,

    /// No device satisfies the requested constraints.
    #[error("No capture device available: {0}")]
    DeviceUnavailable(String),
}

/// Result type alias using `GatewayError`
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
