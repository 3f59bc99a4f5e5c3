//! Media primitives exchanged with the gateway and capture collaborators.
//!
//! A [`MediaTrack`] is a cheap, cloneable reference to one audio or video
//! component. Clones share the same underlying track: stopping any clone
//! stops all of them. Equality and hashing use the gateway-assigned
//! [`TrackId`] only, never the delivery path that produced the reference.

use crate::error::CaptureError;
use crate::types::TrackId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Returns the kind as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug)]
struct TrackInner {
    id: TrackId,
    kind: TrackKind,
    stopped: AtomicBool,
}

/// Shared reference to one media track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a new live track.
    #[must_use]
    pub fn new(id: TrackId, kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Gateway-assigned track identity.
    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.inner.id
    }

    /// Audio or video.
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Whether the track is still delivering media.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track. Stopping an already stopped track is a no-op.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::trace!(
                target: "common.media",
                track_id = %self.inner.id,
                kind = self.inner.kind.as_str(),
                "Track stopped"
            );
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl Hash for MediaTrack {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A stream of remote tracks as enumerated by the gateway.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    /// Stream identifier assigned by the remote side.
    pub id: String,
    /// Tracks currently in the stream.
    pub tracks: Vec<MediaTrack>,
}

/// Locally captured media.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    /// Wrap captured tracks.
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    /// Captured tracks.
    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Whether the stream carries a track of the given kind.
    #[must_use]
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Stop every captured track.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Requested capture resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Constraints passed to the capture collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Capture a microphone track.
    pub audio: bool,
    /// Capture a camera track at the given resolution.
    pub video: Option<Resolution>,
}

/// Media directions requested during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub send_audio: bool,
    pub send_video: bool,
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl MediaConstraints {
    /// Publish audio and video, receive nothing.
    #[must_use]
    pub const fn send_only() -> Self {
        Self {
            send_audio: true,
            send_video: true,
            receive_audio: false,
            receive_video: false,
        }
    }

    /// Receive audio and video, send nothing.
    #[must_use]
    pub const fn receive_only() -> Self {
        Self {
            send_audio: false,
            send_video: false,
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Local media-capture collaborator.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire a local stream satisfying `constraints`.
    async fn acquire_local_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_track_identity_ignores_reference() {
        let a = MediaTrack::new(TrackId::new("t-1"), TrackKind::Video);
        let same_id = MediaTrack::new(TrackId::new("t-1"), TrackKind::Video);
        let other = MediaTrack::new(TrackId::new("t-2"), TrackKind::Video);

        let set: HashSet<MediaTrack> = [a.clone(), same_id, other].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_stop_is_shared_between_clones() {
        let track = MediaTrack::new(TrackId::new("t-1"), TrackKind::Audio);
        let clone = track.clone();
        assert!(clone.is_live());

        track.stop();
        track.stop();
        assert!(!clone.is_live());
    }

    #[test]
    fn test_local_stream_stop_all() {
        let stream = LocalStream::new(vec![
            MediaTrack::new(TrackId::new("mic"), TrackKind::Audio),
            MediaTrack::new(TrackId::new("cam"), TrackKind::Video),
        ]);
        assert!(stream.has_kind(TrackKind::Video));

        stream.stop_all();
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
    }
}
