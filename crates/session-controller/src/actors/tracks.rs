//! Track Aggregator: one de-duplicated track set per subscribed peer.
//!
//! Tracks for a subscription arrive through independent paths (negotiation
//! track callback, stream enumeration in that callback, receiver polling,
//! generic remote-stream notification). All of them funnel into
//! [`TrackAggregator::add_track`], which keys the set by [`TrackId`] so the
//! delivery path never matters.
//!
//! The presentation layer receives a [`TrackSetView`] with the first video
//! track and can follow later additions through it.

use super::messages::SessionNotification;
use super::notifier::Notifier;
use crate::observability::metrics;

use common::media::{MediaTrack, TrackKind};
use common::types::{PeerId, TrackId};
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use tracing::{debug, info};

/// Path through which a track was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackPath {
    /// Track field of the negotiation track callback.
    TrackEvent,
    /// Streams enumerated in the negotiation track callback.
    StreamEvent,
    /// Receiver polling.
    ReceiverPoll,
    /// Generic remote-stream notification.
    RemoteStream,
}

impl TrackPath {
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            TrackPath::TrackEvent => "track_event",
            TrackPath::StreamEvent => "stream_event",
            TrackPath::ReceiverPoll => "receiver_poll",
            TrackPath::RemoteStream => "remote_stream",
        }
    }
}

/// Read-only, live view of one participant's tracks.
#[derive(Debug, Clone)]
pub struct TrackSetView {
    peer_id: PeerId,
    tracks: watch::Receiver<Vec<MediaTrack>>,
}

impl TrackSetView {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Current tracks. Empty once the participant has been removed.
    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.borrow().clone()
    }

    /// Number of current tracks of `kind`.
    #[must_use]
    pub fn count(&self, kind: TrackKind) -> usize {
        self.tracks.borrow().iter().filter(|t| t.kind() == kind).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.borrow().is_empty()
    }

    /// Wait until the set changes. Returns `false` once the owning
    /// subscription has been torn down.
    pub async fn changed(&mut self) -> bool {
        self.tracks.changed().await.is_ok()
    }
}

struct TrackSet {
    display_name: String,
    ids: HashSet<TrackId>,
    tracks: watch::Sender<Vec<MediaTrack>>,
    ready: bool,
}

impl TrackSet {
    fn view(&self, peer_id: PeerId) -> TrackSetView {
        TrackSetView {
            peer_id,
            tracks: self.tracks.subscribe(),
        }
    }
}

/// Result of [`TrackAggregator::add_track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    /// New track; `became_ready` is set for the first video track.
    Added { became_ready: bool },
    /// Already present.
    Duplicate,
    /// No open set for the peer, or the track already ended.
    Ignored,
}

/// Owner of every [`TrackSet`] in a session.
pub(crate) struct TrackAggregator {
    sets: HashMap<PeerId, TrackSet>,
    notifier: Notifier,
}

impl TrackAggregator {
    pub(crate) fn new(notifier: Notifier) -> Self {
        Self {
            sets: HashMap::new(),
            notifier,
        }
    }

    /// Create an empty set for a new subscription. An existing set for the
    /// peer is cleared first.
    pub(crate) fn open(&mut self, peer_id: PeerId, display_name: &str) {
        self.clear(peer_id);
        let (tracks, _) = watch::channel(Vec::new());
        self.sets.insert(
            peer_id,
            TrackSet {
                display_name: display_name.to_string(),
                ids: HashSet::new(),
                tracks,
                ready: false,
            },
        );
    }

    /// Add a track to a peer's set. Idempotent per track identity.
    pub(crate) fn add_track(
        &mut self,
        peer_id: PeerId,
        track: &MediaTrack,
        path: TrackPath,
    ) -> AddOutcome {
        let Some(set) = self.sets.get_mut(&peer_id) else {
            return AddOutcome::Ignored;
        };
        if !track.is_live() {
            return AddOutcome::Ignored;
        }
        if !set.ids.insert(track.id().clone()) {
            metrics::record_track_duplicate(path.as_str());
            return AddOutcome::Duplicate;
        }

        set.tracks.send_modify(|tracks| tracks.push(track.clone()));
        metrics::record_track_received(track.kind().as_str(), path.as_str());
        debug!(
            target: "sc.tracks",
            peer_id = %peer_id,
            track_id = %track.id(),
            kind = track.kind().as_str(),
            path = path.as_str(),
            "Track added"
        );

        let became_ready = !set.ready && track.kind() == TrackKind::Video;
        if became_ready {
            set.ready = true;
            info!(
                target: "sc.tracks",
                peer_id = %peer_id,
                tracks = set.ids.len(),
                "Participant ready"
            );
            self.notifier.notify(SessionNotification::ParticipantReady {
                peer_id,
                display_name: set.display_name.clone(),
                tracks: set.view(peer_id),
            });
        }
        AddOutcome::Added { became_ready }
    }

    /// Stop and drop every track of a peer's set. Returns `true` if a set
    /// existed. A removal notification is emitted only for participants that
    /// were announced ready.
    pub(crate) fn clear(&mut self, peer_id: PeerId) -> bool {
        let Some(set) = self.sets.remove(&peer_id) else {
            return false;
        };
        set.tracks.send_modify(|tracks| {
            for track in tracks.iter() {
                track.stop();
            }
            tracks.clear();
        });
        debug!(
            target: "sc.tracks",
            peer_id = %peer_id,
            released = set.ids.len(),
            "Track set cleared"
        );
        if set.ready {
            self.notifier
                .notify(SessionNotification::ParticipantRemoved { peer_id });
        }
        true
    }

    /// Clear every set.
    pub(crate) fn clear_all(&mut self) {
        let peers: Vec<PeerId> = self.sets.keys().copied().collect();
        for peer_id in peers {
            self.clear(peer_id);
        }
    }

    pub(crate) fn len(&self, peer_id: PeerId) -> usize {
        self.sets.get(&peer_id).map_or(0, |set| set.ids.len())
    }

    pub(crate) fn count(&self, peer_id: PeerId, kind: TrackKind) -> usize {
        self.sets.get(&peer_id).map_or(0, |set| {
            set.tracks.borrow().iter().filter(|t| t.kind() == kind).count()
        })
    }

    pub(crate) fn is_ready(&self, peer_id: PeerId) -> bool {
        self.sets.get(&peer_id).is_some_and(|set| set.ready)
    }
}
