//! Signaling gateway contract.
//!
//! The gateway owns negotiation internals (SDP, ICE, peer connections) and
//! the wire format. Consumers see three layers:
//!
//! ```text
//! Gateway            connect() -> GatewaySession
//! └── GatewaySession attach(plugin, opaque_id) -> Attachment, destroy()
//!     └── PluginHandle send / create_offer / create_answer / detach
//! ```
//!
//! Every attachment carries its own ordered event stream. The gateway may
//! emit any [`HandleEvent`] at any time after attach, including duplicates,
//! and makes no ordering promise across handles.

use crate::error::GatewayResult;
use crate::media::{LocalStream, MediaConstraints, MediaTrack, RemoteStream};
use crate::types::HandleId;
use crate::videoroom::{Jsep, Request, RoomEvent};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted on a plugin handle.
#[derive(Debug, Clone)]
pub enum HandleEvent {
    /// Plugin message, optionally carrying a remote session description.
    Message {
        event: RoomEvent,
        jsep: Option<Jsep>,
    },
    /// Transport (peer connection) went up or down.
    TransportState { up: bool },
    /// Negotiation callback: a track arrived, with the streams it belongs to.
    Track {
        track: Option<MediaTrack>,
        streams: Vec<RemoteStream>,
    },
    /// Generic remote-stream notification.
    RemoteStream(RemoteStream),
    /// The gateway released the handle's media resources.
    Cleanup,
}

impl HandleEvent {
    /// Short event name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            HandleEvent::Message { .. } => "message",
            HandleEvent::TransportState { .. } => "transport_state",
            HandleEvent::Track { .. } => "track",
            HandleEvent::RemoteStream(_) => "remote_stream",
            HandleEvent::Cleanup => "cleanup",
        }
    }
}

/// A freshly attached plugin handle and its event stream.
pub struct Attachment {
    pub handle: Arc<dyn PluginHandle>,
    pub events: mpsc::UnboundedReceiver<HandleEvent>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("handle_id", &self.handle.id())
            .finish_non_exhaustive()
    }
}

/// Entry point: opens a signaling connection.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Open a new signaling connection.
    async fn connect(&self) -> GatewayResult<Arc<dyn GatewaySession>>;
}

/// One signaling connection.
#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Attach a new handle to `plugin`, tagged with `opaque_id`.
    async fn attach(&self, plugin: &str, opaque_id: &str) -> GatewayResult<Attachment>;

    /// Release the connection and every handle still attached to it.
    async fn destroy(&self) -> GatewayResult<()>;
}

/// One plugin attachment.
#[async_trait]
pub trait PluginHandle: Send + Sync {
    /// Gateway-assigned handle identifier.
    fn id(&self) -> HandleId;

    /// Send a request, optionally with a local session description.
    async fn send(&self, request: Request, jsep: Option<Jsep>) -> GatewayResult<()>;

    /// Create an offer publishing `stream`.
    async fn create_offer(
        &self,
        stream: &LocalStream,
        media: MediaConstraints,
    ) -> GatewayResult<Jsep>;

    /// Create an answer to a remote offer.
    async fn create_answer(&self, offer: &Jsep, media: MediaConstraints) -> GatewayResult<Jsep>;

    /// Apply a remote answer to our offer.
    async fn handle_remote_jsep(&self, jsep: &Jsep) -> GatewayResult<()>;

    /// Tracks currently attached to the handle's receivers.
    fn receivers(&self) -> Vec<MediaTrack>;

    /// Release the handle.
    async fn detach(&self) -> GatewayResult<()>;
}
