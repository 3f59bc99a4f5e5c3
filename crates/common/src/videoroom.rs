//! Videoroom request and event payloads.
//!
//! These mirror the videoroom plugin's JSON bodies so a network adapter can
//! serialize them directly. Requests are tagged by `request`, events by
//! `videoroom`.

use crate::types::{PeerId, RoomId};
use serde::{Deserialize, Serialize};

/// Plugin identifier used for every attachment.
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Participant type requested on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Publisher,
    Subscriber,
}

/// Request body sent through a plugin handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum Request {
    /// Join a room, either as a publisher or as a subscriber of `feed`.
    Join {
        room: RoomId,
        ptype: ParticipantType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feed: Option<PeerId>,
    },
    /// Configure the publisher's media (sent with the local offer).
    Configure { audio: bool, video: bool },
    /// Start receiving (sent with the subscriber's answer).
    Start { room: RoomId },
    /// Ask for the current participant list.
    #[serde(rename = "listparticipants")]
    ListParticipants { room: RoomId },
    /// Liveness probe.
    Ping,
}

impl Request {
    /// Join `room` as a publisher participant.
    #[must_use]
    pub fn join_as_publisher(room: RoomId, display: impl Into<String>) -> Self {
        Request::Join {
            room,
            ptype: ParticipantType::Publisher,
            display: Some(display.into()),
            feed: None,
        }
    }

    /// Join `room` as a subscriber of `feed`.
    #[must_use]
    pub fn join_as_subscriber(room: RoomId, feed: PeerId) -> Self {
        Request::Join {
            room,
            ptype: ParticipantType::Subscriber,
            display: None,
            feed: Some(feed),
        }
    }

    /// Short request name for logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Request::Join { .. } => "join",
            Request::Configure { .. } => "configure",
            Request::Start { .. } => "start",
            Request::ListParticipants { .. } => "listparticipants",
            Request::Ping => "ping",
        }
    }
}

/// SDP type of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl Jsep {
    /// Build an offer.
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A publisher entry in a join confirmation or room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// A participant entry in a participant-list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default)]
    pub publisher: bool,
}

/// Asynchronous event body delivered on a plugin handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "videoroom", rename_all = "lowercase")]
pub enum RoomEvent {
    /// Join confirmation for a publisher participant.
    Joined {
        room: RoomId,
        /// Our own feed identifier in the room.
        id: PeerId,
        #[serde(default)]
        publishers: Vec<PublisherInfo>,
    },
    /// Subscriber attached to a feed (an offer follows in the same message).
    Attached {
        room: RoomId,
        id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<String>,
    },
    /// Participant-list response.
    Participants {
        room: RoomId,
        participants: Vec<ParticipantInfo>,
    },
    /// Generic room event.
    Event(RoomEventBody),
}

/// Body of a generic room event; any combination of fields may be present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomEventBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publishers: Vec<PublisherInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<ParticipantInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpublished: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaving: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RoomEventBody {
    /// Event announcing publishers.
    #[must_use]
    pub fn publishers(publishers: Vec<PublisherInfo>) -> Self {
        Self {
            publishers,
            ..Self::default()
        }
    }

    /// Error event.
    #[must_use]
    pub fn error(code: u32, reason: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}
