//! Fault-injection knobs for the loopback videoroom.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How publisher announcements reach the other publishers in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnouncementMode {
    /// Delivered as soon as a publisher starts publishing.
    #[default]
    Immediate,
    /// Held until any handle on the recipient's connection sends a request.
    Buffered,
    /// Never delivered; peers are only found through participant lists and
    /// join confirmations.
    Dropped,
}

/// Which paths report a subscriber's tracks once it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackDelivery {
    /// One track callback per track.
    #[default]
    OnTrack,
    /// A single track callback carrying only the stream.
    StreamEvents,
    /// A generic remote-stream notification.
    RemoteStream,
    /// No events; tracks are only visible through the receivers.
    ReceiversOnly,
    /// Every path at once, so each track is reported several times.
    All,
    /// Nothing at all.
    Withheld,
}

impl TrackDelivery {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackDelivery::OnTrack => "on_track",
            TrackDelivery::StreamEvents => "stream_events",
            TrackDelivery::RemoteStream => "remote_stream",
            TrackDelivery::ReceiversOnly => "receivers_only",
            TrackDelivery::All => "all",
            TrackDelivery::Withheld => "withheld",
        }
    }
}

impl fmt::Display for TrackDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown track delivery mode: {0}")]
pub struct UnknownTrackDelivery(pub String);

impl FromStr for TrackDelivery {
    type Err = UnknownTrackDelivery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_track" => Ok(TrackDelivery::OnTrack),
            "stream_events" => Ok(TrackDelivery::StreamEvents),
            "remote_stream" => Ok(TrackDelivery::RemoteStream),
            "receivers_only" => Ok(TrackDelivery::ReceiversOnly),
            "all" => Ok(TrackDelivery::All),
            "withheld" => Ok(TrackDelivery::Withheld),
            other => Err(UnknownTrackDelivery(other.to_string())),
        }
    }
}

/// Behavior of a [`LoopbackGateway`](crate::LoopbackGateway).
#[derive(Debug, Clone, Default)]
pub struct LoopbackConfig {
    /// The first join confirmation of each publisher handle carries an empty
    /// publisher list. A repeated join on the same handle is answered in
    /// full.
    pub suppress_join_publishers: bool,
    pub announcements: AnnouncementMode,
    pub track_delivery: TrackDelivery,
    /// `connect()` fails.
    pub fail_connect: bool,
    /// `attach()` fails.
    pub fail_attach: bool,
    /// Publisher joins are answered with this error event.
    pub reject_join: Option<(u32, String)>,
    /// `create_answer()` fails.
    pub fail_answer: bool,
}
