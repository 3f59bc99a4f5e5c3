//! # Videoroom Loopback
//!
//! An in-process videoroom gateway and capture device for Telecare tests
//! and demos, without a media server.
//!
//! The loopback implements the `common::gateway` and `common::media`
//! contracts: rooms, publishers, subscribers, offers and answers, track
//! delivery and cleanup. Its knobs reproduce the unreliable event source a
//! real gateway presents to clients:
//!
//! - join confirmations that omit existing publishers
//! - publisher announcements that are held until the client sends
//!   something, or never delivered
//! - tracks reported through one path, several paths, or only through the
//!   receivers
//! - failures on connect, attach, join and answer
//!
//! ## Modules
//!
//! - `config` - Fault-injection knobs
//! - `gateway` - `LoopbackGateway` and its builder
//! - `room` - Shared room state
//! - `capture` - `LoopbackCapture`

pub mod capture;
pub mod config;
pub mod gateway;
pub mod room;

pub use capture::LoopbackCapture;
pub use config::{AnnouncementMode, LoopbackConfig, TrackDelivery, UnknownTrackDelivery};
pub use gateway::{LoopbackGateway, LoopbackGatewayBuilder};
pub use room::{RequestRecord, ALREADY_JOINED, NOT_JOINED, NO_SUCH_FEED};

use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber honoring `RUST_LOG` (default `warn`).
/// Safe to call from every test.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
