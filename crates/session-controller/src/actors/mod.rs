//! Actor model implementation for the session controller.
//!
//! ```text
//! SessionActor (one per local participant)
//! ├── owns membership state (connection, publish handle, local stream)
//! ├── DiscoveryEngine   - roster, attempt sequence, probes
//! ├── SubscriptionManager - one subscriber handle per remote peer
//! └── TrackAggregator   - one de-duplicated track set per peer
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single mailbox**: Gateway events, timers and I/O completions are all
//!   posted to the session's `mpsc` channel and handled one at a time
//! - **CancellationToken scopes**: Membership, discovery runs and
//!   subscriptions each own a child token; cancelling one stops its timers
//!   and forwarders
//! - **Stale completion rejection**: Completions carry the id of the scope
//!   that issued them and are ignored (and their resources released) once
//!   that scope is gone
//!
//! # Modules
//!
//! - [`session`] - `SessionActor` and its handle
//! - [`discovery`] - Discovery Engine and roster
//! - [`subscription`] - Subscription Manager
//! - [`tracks`] - Track Aggregator and the `TrackSetView` handed to the UI
//! - [`messages`] - Message, state and notification types
//! - [`mailbox`] - Timers, I/O tasks and event forwarding into the mailbox
//! - [`notifier`] - Bounded notification delivery

pub mod discovery;
pub mod mailbox;
pub mod messages;
pub mod notifier;
pub mod session;
pub mod subscription;
pub mod tracks;

// Re-export primary types
pub use messages::{
    DiscoveryStatus, NegotiationState, RemoteParticipant, Role, SessionNotification,
    SessionSnapshot, SessionState, SubscriptionSnapshot,
};
pub use session::{SessionActor, SessionHandle};
pub use tracks::TrackSetView;
