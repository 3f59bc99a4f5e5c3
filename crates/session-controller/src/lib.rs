//! Session Controller (SC) Library
//!
//! This library provides the client-side orchestration for a Telecare
//! consultation room - one patient publishing a stream and one or more
//! doctors discovering and subscribing to every publisher in the room:
//!
//! - Room join and local-stream publication
//! - Peer discovery with bounded retries over an unreliable event source
//! - Per-peer subscription lifecycle with replacement and teardown
//! - De-duplicated aggregation of inbound tracks into per-participant sets
//!
//! # Architecture
//!
//! Each local identity is one `SessionActor`, a single task with one mailbox:
//!
//! ```text
//! SessionActor (one per local participant)
//! ├── owns the publish handle and the local stream
//! ├── DiscoveryEngine (roster + bounded attempt sequence)
//! ├── SubscriptionManager (one subscriber handle per remote peer)
//! └── TrackAggregator (one de-duplicated track set per subscription)
//! ```
//!
//! Gateway events, timer ticks and I/O completions are all delivered as
//! messages to that mailbox and handled one at a time, so no component
//! needs locking. Timers are owned by cancellation tokens scoped to the
//! session, the discovery run or the subscription that scheduled them.
//!
//! # Modules
//!
//! - [`actors`] - Session actor and its components
//! - [`config`] - Session configuration from environment
//! - [`errors`] - Error types and failure causes
//! - [`observability`] - Metrics

pub mod actors;
pub mod config;
pub mod errors;
pub mod observability;
