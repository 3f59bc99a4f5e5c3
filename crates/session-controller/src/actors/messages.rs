//! Message and view types for the session actor.
//!
//! Every input to a session, whether a user command, a gateway event, a timer
//! tick or an I/O completion, is a [`SessionMessage`] delivered to the same
//! `tokio::sync::mpsc` mailbox. Commands reply through `tokio::sync::oneshot`.
//!
//! I/O completions and timer ticks carry the identifier of the scope that
//! issued them (membership generation, discovery run, probe, subscription).
//! A message whose scope has been released is a no-op when it arrives.

use crate::errors::{ScError, SessionFailure};

use super::session::{release_connection, release_handle};
use super::tracks::TrackSetView;

use chrono::{DateTime, Utc};
use common::error::{CaptureError, GatewayError, GatewayResult};
use common::gateway::{Attachment, GatewaySession, HandleEvent};
use common::media::{CaptureConstraints, LocalStream, Resolution};
use common::types::{PeerId, RoomId};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Role of the local participant in a consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes on join; connects to doctors explicitly.
    Patient,
    /// Subscribes to every announced publisher; publishes on request.
    Doctor,
}

impl Role {
    /// Returns the role as a string for logs and opaque identifiers.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
        }
    }

    /// Whether capture and publication start as soon as the room is joined.
    #[must_use]
    pub const fn publishes_on_join(&self) -> bool {
        matches!(self, Role::Patient)
    }

    /// Whether announced publishers are subscribed to without user action.
    #[must_use]
    pub const fn auto_subscribes(&self) -> bool {
        matches!(self, Role::Doctor)
    }

    /// Capture constraints for this role's local stream.
    #[must_use]
    pub const fn capture_constraints(&self) -> CaptureConstraints {
        let video = match self {
            Role::Patient => Resolution {
                width: 640,
                height: 480,
            },
            Role::Doctor => Resolution {
                width: 320,
                height: 240,
            },
        };
        CaptureConstraints {
            audio: true,
            video: Some(video),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local membership state.
///
/// ```text
/// Idle → Connecting → Joining → Joined → (Publishing) → Active → Leaving → Idle
///                  any non-terminal state → Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Joining,
    Joined,
    Publishing,
    Active,
    Leaving,
    /// Terminal until `leave()` resets the session.
    Failed(SessionFailure),
}

impl SessionState {
    /// Returns the state as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Publishing => "publishing",
            SessionState::Active => "active",
            SessionState::Leaving => "leaving",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Whether the session currently holds (or is acquiring) room resources.
    #[must_use]
    pub const fn is_member(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Joining
                | SessionState::Joined
                | SessionState::Publishing
                | SessionState::Active
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer discovered in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteParticipant {
    pub peer_id: PeerId,
    pub display_name: String,
    pub publishing: bool,
    /// Media from this peer is being received.
    pub active: bool,
    /// The user disconnected from this peer; announcements do not
    /// re-subscribe it until `connect_to_peer` is called.
    pub dismissed: bool,
}

/// Progress of the discovery sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiscoveryStatus {
    /// Not started for this membership.
    Idle,
    /// Attempt sequence in progress; `attempt` is the last attempt sent.
    Running { attempt: u32 },
    /// The roster became non-empty.
    Converged { attempts: u32 },
    /// All attempts elapsed with an empty roster.
    Exhausted { attempts: u32 },
}

/// Negotiation progress of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Waiting for the gateway attachment.
    Attaching,
    /// Subscriber join sent, waiting for the remote offer.
    AwaitingOffer,
    /// Offer received, answer being produced and sent.
    Answering,
    /// Answer delivered with the start request.
    Started,
}

impl NegotiationState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Attaching => "attaching",
            NegotiationState::AwaitingOffer => "awaiting_offer",
            NegotiationState::Answering => "answering",
            NegotiationState::Started => "started",
        }
    }
}

/// Diagnostic view of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    pub peer_id: PeerId,
    pub negotiation: NegotiationState,
    pub audio_tracks: usize,
    pub video_tracks: usize,
    pub ready: bool,
    pub polling: bool,
}

/// Diagnostic view of the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    #[serde(serialize_with = "serialize_state")]
    pub state: SessionState,
    pub role: Option<Role>,
    pub room_id: Option<RoomId>,
    pub display_name: Option<String>,
    /// Our own feed identifier once joined.
    pub own_feed: Option<PeerId>,
    /// Wall-clock time of the join confirmation.
    pub joined_at: Option<DateTime<Utc>>,
    pub local_stream: bool,
    pub roster: Vec<RemoteParticipant>,
    pub discovery: DiscoveryStatus,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

fn serialize_state<S: serde::Serializer>(state: &SessionState, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(state.as_str())
}

impl SessionSnapshot {
    /// Snapshot of a session with no membership.
    #[must_use]
    pub fn idle(state: SessionState) -> Self {
        Self {
            state,
            role: None,
            room_id: None,
            display_name: None,
            own_feed: None,
            joined_at: None,
            local_stream: false,
            roster: Vec::new(),
            discovery: DiscoveryStatus::Idle,
            subscriptions: Vec::new(),
        }
    }
}

/// Notifications delivered to the presentation layer.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// Human-readable progress text.
    StatusChanged(String),
    StateChanged(SessionState),
    LocalStreamReady(LocalStream),
    /// First video track received from a peer.
    ParticipantReady {
        peer_id: PeerId,
        display_name: String,
        tracks: TrackSetView,
    },
    /// A ready participant's tracks were released.
    ParticipantRemoved { peer_id: PeerId },
    RosterChanged(Vec<RemoteParticipant>),
    /// Discovery exhausted its attempts with an empty roster.
    NoPeersFound,
    /// Receiver polling exhausted its checks with no tracks.
    NoMediaReceived { peer_id: PeerId },
}

/// Messages processed by the `SessionActor`.
pub(crate) enum SessionMessage {
    // ---- Commands ----
    Join {
        room_id: RoomId,
        display_name: String,
        role: Role,
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },
    Leave {
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },
    Publish {
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },
    ConnectToPeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },
    DisconnectFromPeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },
    RefreshDiscovery {
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },
    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },

    // ---- Membership ----
    Connected {
        generation: u64,
        result: GatewayResult<Arc<dyn GatewaySession>>,
    },
    PublisherAttached {
        generation: u64,
        result: GatewayResult<Attachment>,
    },
    PublisherEvent {
        generation: u64,
        event: HandleEvent,
    },
    PublisherRequestFailed {
        generation: u64,
        request: &'static str,
        error: GatewayError,
    },
    JoinTimeout {
        generation: u64,
    },
    LocalStreamAcquired {
        generation: u64,
        result: Result<LocalStream, CaptureError>,
    },
    PublishNegotiated {
        generation: u64,
        result: GatewayResult<()>,
    },
    Released {
        generation: u64,
    },

    // ---- Discovery ----
    DiscoveryTick {
        run: u64,
        attempt: u32,
    },
    DiscoveryPing {
        run: u64,
    },
    DiscoveryRejoin {
        run: u64,
    },
    ProbeAttached {
        probe: u64,
        result: GatewayResult<Attachment>,
    },
    ProbeEvent {
        probe: u64,
        event: HandleEvent,
    },
    ProbeExpired {
        probe: u64,
    },

    // ---- Subscriptions ----
    SubscriberAttached {
        peer_id: PeerId,
        subscription: u64,
        result: GatewayResult<Attachment>,
    },
    SubscriberEvent {
        peer_id: PeerId,
        subscription: u64,
        event: HandleEvent,
    },
    AnswerSent {
        peer_id: PeerId,
        subscription: u64,
        result: GatewayResult<()>,
    },
    SubscriptionFailed {
        peer_id: PeerId,
        subscription: u64,
        stage: &'static str,
        error: GatewayError,
    },
    TrackPoll {
        peer_id: PeerId,
        subscription: u64,
        check: u32,
    },
}

impl SessionMessage {
    /// Short message name for logs.
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            SessionMessage::Join { .. } => "join",
            SessionMessage::Leave { .. } => "leave",
            SessionMessage::Publish { .. } => "publish",
            SessionMessage::ConnectToPeer { .. } => "connect_to_peer",
            SessionMessage::DisconnectFromPeer { .. } => "disconnect_from_peer",
            SessionMessage::RefreshDiscovery { .. } => "refresh_discovery",
            SessionMessage::GetSnapshot { .. } => "get_snapshot",
            SessionMessage::Connected { .. } => "connected",
            SessionMessage::PublisherAttached { .. } => "publisher_attached",
            SessionMessage::PublisherEvent { .. } => "publisher_event",
            SessionMessage::PublisherRequestFailed { .. } => "publisher_request_failed",
            SessionMessage::JoinTimeout { .. } => "join_timeout",
            SessionMessage::LocalStreamAcquired { .. } => "local_stream_acquired",
            SessionMessage::PublishNegotiated { .. } => "publish_negotiated",
            SessionMessage::Released { .. } => "released",
            SessionMessage::DiscoveryTick { .. } => "discovery_tick",
            SessionMessage::DiscoveryPing { .. } => "discovery_ping",
            SessionMessage::DiscoveryRejoin { .. } => "discovery_rejoin",
            SessionMessage::ProbeAttached { .. } => "probe_attached",
            SessionMessage::ProbeEvent { .. } => "probe_event",
            SessionMessage::ProbeExpired { .. } => "probe_expired",
            SessionMessage::SubscriberAttached { .. } => "subscriber_attached",
            SessionMessage::SubscriberEvent { .. } => "subscriber_event",
            SessionMessage::AnswerSent { .. } => "answer_sent",
            SessionMessage::SubscriptionFailed { .. } => "subscription_failed",
            SessionMessage::TrackPoll { .. } => "track_poll",
        }
    }

    /// Release gateway or capture resources carried by a completion that
    /// could not be delivered because the session is gone.
    pub(crate) async fn release_orphaned(self) {
        let name = self.name();
        match self {
            SessionMessage::Connected {
                result: Ok(connection),
                ..
            } => release_connection(connection.as_ref()).await,
            SessionMessage::PublisherAttached {
                result: Ok(attachment),
                ..
            } => release_handle(attachment.handle.as_ref(), "publisher").await,
            SessionMessage::ProbeAttached {
                result: Ok(attachment),
                ..
            } => release_handle(attachment.handle.as_ref(), "probe").await,
            SessionMessage::SubscriberAttached {
                result: Ok(attachment),
                ..
            } => release_handle(attachment.handle.as_ref(), "subscriber").await,
            SessionMessage::LocalStreamAcquired {
                result: Ok(stream), ..
            } => stream.stop_all(),
            _ => return,
        }
        debug!(
            target: "sc.release",
            message = name,
            "Released resources of an undeliverable completion"
        );
    }
}

impl fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
