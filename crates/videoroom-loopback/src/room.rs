//! In-memory videoroom state shared by every loopback connection.
//!
//! Feeds are identified by the publisher's handle id. A publisher is listed
//! in its room from its first join, and counts as publishing once it has
//! configured an offer. Only publishing feeds are announced and can be
//! subscribed to.

use crate::config::{AnnouncementMode, LoopbackConfig, TrackDelivery};

use common::error::{GatewayError, GatewayResult};
use common::gateway::HandleEvent;
use common::media::{LocalStream, MediaTrack, RemoteStream, TrackKind};
use common::types::{HandleId, PeerId, RoomId, TrackId};
use common::videoroom::{
    Jsep, ParticipantInfo, ParticipantType, PublisherInfo, Request, RoomEvent, RoomEventBody,
    SdpType,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Error code for a subscriber join to a feed that is not publishing.
pub const NO_SUCH_FEED: u32 = 428;
/// Error code for a request that needs a joined participant.
pub const NOT_JOINED: u32 = 403;
/// Error code for a join that conflicts with the handle's participation.
pub const ALREADY_JOINED: u32 = 425;

/// One request received by the loopback, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub handle: HandleId,
    pub request: &'static str,
}

enum Participation {
    None,
    Publisher { room: RoomId },
    Subscriber { room: RoomId, feed: PeerId },
}

struct HandleEntry {
    connection: u64,
    opaque_id: String,
    events: mpsc::UnboundedSender<HandleEvent>,
    buffered: Vec<HandleEvent>,
    participation: Participation,
    /// Tracks of the last offer, published on configure.
    offered: Vec<MediaTrack>,
    receivers: Vec<MediaTrack>,
}

struct Feed {
    display: String,
    /// `None` until the publisher configures an offer.
    tracks: Option<Vec<MediaTrack>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    connections: HashMap<u64, HashSet<HandleId>>,
    handles: HashMap<HandleId, HandleEntry>,
    rooms: HashMap<RoomId, BTreeMap<PeerId, Feed>>,
    requests: Vec<RequestRecord>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn open_connection(&mut self) -> u64 {
        let id = self.next_id();
        self.connections.insert(id, HashSet::new());
        debug!(target: "loopback.room", connection = id, "Connection opened");
        id
    }

    /// Detach every handle of a connection and forget it.
    pub(crate) fn close_connection(&mut self, connection: u64) -> GatewayResult<()> {
        let handles = self
            .connections
            .remove(&connection)
            .ok_or(GatewayError::Closed)?;
        for handle in handles {
            self.release(handle);
        }
        debug!(target: "loopback.room", connection, "Connection closed");
        Ok(())
    }

    pub(crate) fn attach(
        &mut self,
        connection: u64,
        opaque_id: &str,
    ) -> GatewayResult<(HandleId, mpsc::UnboundedReceiver<HandleEvent>)> {
        if !self.connections.contains_key(&connection) {
            return Err(GatewayError::Closed);
        }
        let handle = HandleId(self.next_id());
        let (events, receiver) = mpsc::unbounded_channel();
        self.handles.insert(
            handle,
            HandleEntry {
                connection,
                opaque_id: opaque_id.to_string(),
                events,
                buffered: Vec::new(),
                participation: Participation::None,
                offered: Vec::new(),
                receivers: Vec::new(),
            },
        );
        if let Some(handles) = self.connections.get_mut(&connection) {
            handles.insert(handle);
        }
        debug!(target: "loopback.room", connection, handle = %handle, opaque_id, "Handle attached");
        Ok((handle, receiver))
    }

    pub(crate) fn detach(&mut self, handle: HandleId) -> GatewayResult<()> {
        let connection = self
            .handles
            .get(&handle)
            .map(|entry| entry.connection)
            .ok_or(GatewayError::Closed)?;
        if let Some(handles) = self.connections.get_mut(&connection) {
            handles.remove(&handle);
        }
        self.release(handle);
        Ok(())
    }

    fn release(&mut self, handle: HandleId) {
        let Some(entry) = self.handles.remove(&handle) else {
            return;
        };
        let _ = entry.events.send(HandleEvent::Cleanup);
        for track in &entry.receivers {
            track.stop();
        }
        if let Participation::Publisher { room } = entry.participation {
            self.leave_room(room, PeerId(handle.0));
        }
        debug!(
            target: "loopback.room",
            handle = %handle,
            opaque_id = %entry.opaque_id,
            "Handle detached"
        );
    }

    pub(crate) fn send(
        &mut self,
        config: &LoopbackConfig,
        handle: HandleId,
        request: Request,
        jsep: Option<Jsep>,
    ) -> GatewayResult<()> {
        let connection = self
            .handles
            .get(&handle)
            .map(|entry| entry.connection)
            .ok_or(GatewayError::Closed)?;
        self.requests.push(RequestRecord {
            handle,
            request: request.name(),
        });
        self.flush(connection);

        match request {
            Request::Join {
                room,
                ptype: ParticipantType::Publisher,
                display,
                ..
            } => self.join_publisher(config, handle, room, display),
            Request::Join {
                room,
                ptype: ParticipantType::Subscriber,
                feed,
                ..
            } => self.join_subscriber(handle, room, feed.unwrap_or(PeerId(0))),
            Request::Configure { audio, video } => {
                self.configure(config, handle, audio, video, jsep);
            }
            Request::Start { room } => self.start(config, handle, room, jsep),
            Request::ListParticipants { room } => {
                let participants = self
                    .rooms
                    .get(&room)
                    .map(|feeds| {
                        feeds
                            .iter()
                            .map(|(id, feed)| ParticipantInfo {
                                id: *id,
                                display: Some(feed.display.clone()),
                                publisher: feed.tracks.is_some(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.emit_message(handle, RoomEvent::Participants { room, participants }, None);
            }
            Request::Ping => {}
        }
        Ok(())
    }

    fn join_publisher(
        &mut self,
        config: &LoopbackConfig,
        handle: HandleId,
        room: RoomId,
        display: Option<String>,
    ) {
        if let Some((code, reason)) = &config.reject_join {
            self.emit_error(handle, *code, reason);
            return;
        }
        let feed = PeerId(handle.0);
        let first = match self.handles.get(&handle).map(|entry| &entry.participation) {
            Some(Participation::None) => true,
            Some(Participation::Publisher { room: joined }) if *joined == room => false,
            _ => {
                self.emit_error(handle, ALREADY_JOINED, "Already in as a participant");
                return;
            }
        };

        let publishers = if first && config.suppress_join_publishers {
            Vec::new()
        } else {
            self.publishing(room, feed)
        };
        if first {
            if let Some(entry) = self.handles.get_mut(&handle) {
                entry.participation = Participation::Publisher { room };
            }
            self.rooms.entry(room).or_default().insert(
                feed,
                Feed {
                    display: display.unwrap_or_default(),
                    tracks: None,
                },
            );
            info!(target: "loopback.room", room_id = %room, feed = %feed, "Publisher joined");
        }
        self.emit_message(
            handle,
            RoomEvent::Joined {
                room,
                id: feed,
                publishers,
            },
            None,
        );
    }

    fn join_subscriber(&mut self, handle: HandleId, room: RoomId, feed: PeerId) {
        let display = self
            .rooms
            .get(&room)
            .and_then(|feeds| feeds.get(&feed))
            .filter(|f| f.tracks.is_some())
            .map(|f| f.display.clone());
        let Some(display) = display else {
            self.emit_error(handle, NO_SUCH_FEED, &format!("No such feed ({feed})"));
            return;
        };
        if let Some(entry) = self.handles.get_mut(&handle) {
            entry.participation = Participation::Subscriber { room, feed };
        }
        let offer = Jsep::offer(format!("v=0\r\ns=loopback feed {feed}\r\n"));
        self.emit_message(
            handle,
            RoomEvent::Attached {
                room,
                id: feed,
                display: Some(display),
            },
            Some(offer),
        );
    }

    fn configure(
        &mut self,
        config: &LoopbackConfig,
        handle: HandleId,
        audio: bool,
        video: bool,
        jsep: Option<Jsep>,
    ) {
        let Some(entry) = self.handles.get_mut(&handle) else {
            return;
        };
        let Participation::Publisher { room } = entry.participation else {
            self.emit_error(handle, NOT_JOINED, "Not joined as a publisher");
            return;
        };
        let configured = RoomEventBody {
            configured: Some("ok".to_string()),
            ..RoomEventBody::default()
        };
        if !jsep.is_some_and(|j| j.kind == SdpType::Offer) {
            self.emit_message(handle, RoomEvent::Event(configured), None);
            return;
        }

        let tracks: Vec<MediaTrack> = entry
            .offered
            .drain(..)
            .filter(|t| match t.kind() {
                TrackKind::Audio => audio,
                TrackKind::Video => video,
            })
            .collect();
        let feed = PeerId(handle.0);
        let mut display = String::new();
        if let Some(published) = self.rooms.get_mut(&room).and_then(|feeds| feeds.get_mut(&feed)) {
            info!(
                target: "loopback.room",
                room_id = %room,
                feed = %feed,
                tracks = tracks.len(),
                "Publisher configured"
            );
            published.tracks = Some(tracks);
            display.clone_from(&published.display);
        }
        let answer = Jsep::answer(format!("v=0\r\ns=loopback publisher {feed}\r\n"));
        self.emit_message(handle, RoomEvent::Event(configured), Some(answer));
        self.announce(config, room, feed, display);
    }

    /// Tell every other publisher in `room` that `feed` is publishing.
    fn announce(&mut self, config: &LoopbackConfig, room: RoomId, feed: PeerId, display: String) {
        if config.announcements == AnnouncementMode::Dropped {
            debug!(target: "loopback.room", feed = %feed, "Dropping announcement");
            return;
        }
        let event = HandleEvent::Message {
            event: RoomEvent::Event(RoomEventBody::publishers(vec![PublisherInfo {
                id: feed,
                display: Some(display),
            }])),
            jsep: None,
        };
        for (id, entry) in &mut self.handles {
            let in_room = matches!(
                entry.participation,
                Participation::Publisher { room: r } if r == room
            );
            if !in_room || PeerId(id.0) == feed {
                continue;
            }
            if config.announcements == AnnouncementMode::Buffered {
                entry.buffered.push(event.clone());
            } else {
                let _ = entry.events.send(event.clone());
            }
        }
    }

    fn start(
        &mut self,
        config: &LoopbackConfig,
        handle: HandleId,
        room: RoomId,
        jsep: Option<Jsep>,
    ) {
        let feed = match self.handles.get(&handle).map(|entry| &entry.participation) {
            Some(Participation::Subscriber { room: r, feed }) if *r == room => *feed,
            _ => {
                self.emit_error(handle, NOT_JOINED, "Not subscribed to a feed");
                return;
            }
        };
        if !jsep.is_some_and(|j| j.kind == SdpType::Answer) {
            self.emit_error(handle, NOT_JOINED, "Missing answer");
            return;
        }
        let published = self
            .rooms
            .get(&room)
            .and_then(|feeds| feeds.get(&feed))
            .and_then(|f| f.tracks.clone());
        let Some(published) = published else {
            self.emit_error(handle, NO_SUCH_FEED, &format!("No such feed ({feed})"));
            return;
        };

        // Each subscriber receives its own copy of the feed's tracks.
        let tracks: Vec<MediaTrack> = published
            .iter()
            .map(|t| MediaTrack::new(TrackId::new(format!("{handle}-{}", t.id())), t.kind()))
            .collect();
        let stream = RemoteStream {
            id: format!("feed-{feed}"),
            tracks: tracks.clone(),
        };
        let delivery = config.track_delivery;
        if let Some(entry) = self.handles.get_mut(&handle) {
            if delivery != TrackDelivery::Withheld {
                entry.receivers.clone_from(&tracks);
            }
        }

        let started = RoomEventBody {
            started: Some("ok".to_string()),
            ..RoomEventBody::default()
        };
        self.emit_message(handle, RoomEvent::Event(started), None);
        self.emit(handle, HandleEvent::TransportState { up: true });
        match delivery {
            TrackDelivery::OnTrack => {
                for track in tracks {
                    self.emit(
                        handle,
                        HandleEvent::Track {
                            track: Some(track),
                            streams: Vec::new(),
                        },
                    );
                }
            }
            TrackDelivery::StreamEvents => self.emit(
                handle,
                HandleEvent::Track {
                    track: None,
                    streams: vec![stream],
                },
            ),
            TrackDelivery::RemoteStream => self.emit(handle, HandleEvent::RemoteStream(stream)),
            TrackDelivery::All => {
                for track in tracks {
                    self.emit(
                        handle,
                        HandleEvent::Track {
                            track: Some(track),
                            streams: vec![stream.clone()],
                        },
                    );
                }
                self.emit(handle, HandleEvent::RemoteStream(stream));
            }
            TrackDelivery::ReceiversOnly | TrackDelivery::Withheld => {}
        }
        debug!(
            target: "loopback.room",
            handle = %handle,
            feed = %feed,
            delivery = delivery.as_str(),
            "Subscriber started"
        );
    }

    /// Remove a publisher from its room and notify everyone concerned.
    fn leave_room(&mut self, room: RoomId, feed: PeerId) {
        let Some(removed) = self.rooms.get_mut(&room).and_then(|feeds| feeds.remove(&feed)) else {
            return;
        };
        let was_publishing = removed.tracks.is_some();
        info!(target: "loopback.room", room_id = %room, feed = %feed, "Publisher left");

        for entry in self.handles.values_mut() {
            match entry.participation {
                Participation::Publisher { room: r } if r == room => {
                    if was_publishing {
                        let unpublished = RoomEventBody {
                            unpublished: Some(feed),
                            ..RoomEventBody::default()
                        };
                        let _ = entry.events.send(HandleEvent::Message {
                            event: RoomEvent::Event(unpublished),
                            jsep: None,
                        });
                    }
                    let leaving = RoomEventBody {
                        leaving: Some(feed),
                        ..RoomEventBody::default()
                    };
                    let _ = entry.events.send(HandleEvent::Message {
                        event: RoomEvent::Event(leaving),
                        jsep: None,
                    });
                }
                Participation::Subscriber { room: r, feed: f } if r == room && f == feed => {
                    let unpublished = RoomEventBody {
                        unpublished: Some(feed),
                        ..RoomEventBody::default()
                    };
                    let _ = entry.events.send(HandleEvent::Message {
                        event: RoomEvent::Event(unpublished),
                        jsep: None,
                    });
                    for track in entry.receivers.drain(..) {
                        track.stop();
                    }
                    let _ = entry.events.send(HandleEvent::Cleanup);
                }
                _ => {}
            }
        }
    }

    /// Close the media of every subscriber to `feed` while the feed keeps
    /// publishing. The handles stay attached; only the cleanup callback
    /// tells their owners.
    pub(crate) fn hang_up_subscribers(&mut self, feed: PeerId) -> usize {
        let mut closed = 0;
        for (id, entry) in &mut self.handles {
            let watching = matches!(
                entry.participation,
                Participation::Subscriber { feed: f, .. } if f == feed
            );
            if !watching {
                continue;
            }
            entry.participation = Participation::None;
            for track in entry.receivers.drain(..) {
                track.stop();
            }
            let _ = entry.events.send(HandleEvent::Cleanup);
            debug!(target: "loopback.room", handle = %id, feed = %feed, "Subscriber hung up");
            closed += 1;
        }
        closed
    }

    /// Publishing feeds of `room`, except `own`.
    fn publishing(&self, room: RoomId, own: PeerId) -> Vec<PublisherInfo> {
        self.rooms
            .get(&room)
            .map(|feeds| {
                feeds
                    .iter()
                    .filter(|(id, feed)| **id != own && feed.tracks.is_some())
                    .map(|(id, feed)| PublisherInfo {
                        id: *id,
                        display: Some(feed.display.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver every buffered announcement on a connection.
    fn flush(&mut self, connection: u64) {
        for entry in self.handles.values_mut() {
            if entry.connection != connection || entry.buffered.is_empty() {
                continue;
            }
            debug!(
                target: "loopback.room",
                connection,
                events = entry.buffered.len(),
                "Flushing buffered announcements"
            );
            for event in entry.buffered.drain(..) {
                let _ = entry.events.send(event);
            }
        }
    }

    fn emit(&self, handle: HandleId, event: HandleEvent) {
        if let Some(entry) = self.handles.get(&handle) {
            let _ = entry.events.send(event);
        }
    }

    fn emit_message(&self, handle: HandleId, event: RoomEvent, jsep: Option<Jsep>) {
        self.emit(handle, HandleEvent::Message { event, jsep });
    }

    fn emit_error(&self, handle: HandleId, code: u32, reason: &str) {
        debug!(target: "loopback.room", handle = %handle, code, reason, "Request rejected");
        self.emit_message(handle, RoomEvent::Event(RoomEventBody::error(code, reason)), None);
    }

    pub(crate) fn create_offer(
        &mut self,
        handle: HandleId,
        stream: &LocalStream,
    ) -> GatewayResult<Jsep> {
        let entry = self.handles.get_mut(&handle).ok_or(GatewayError::Closed)?;
        entry.offered = stream.tracks().to_vec();
        Ok(Jsep::offer(format!(
            "v=0\r\ns=loopback offer {handle}\r\nm={}\r\n",
            entry.offered.len()
        )))
    }

    pub(crate) fn create_answer(
        &self,
        config: &LoopbackConfig,
        handle: HandleId,
        offer: &Jsep,
    ) -> GatewayResult<Jsep> {
        if !self.handles.contains_key(&handle) {
            return Err(GatewayError::Closed);
        }
        if config.fail_answer {
            return Err(GatewayError::Negotiation("answer rejected".to_string()));
        }
        if offer.kind != SdpType::Offer {
            return Err(GatewayError::Negotiation("expected an offer".to_string()));
        }
        Ok(Jsep::answer(format!("v=0\r\ns=loopback answer {handle}\r\n")))
    }

    pub(crate) fn is_attached(&self, handle: HandleId) -> bool {
        self.handles.contains_key(&handle)
    }

    pub(crate) fn receivers(&self, handle: HandleId) -> Vec<MediaTrack> {
        self.handles
            .get(&handle)
            .map(|entry| entry.receivers.clone())
            .unwrap_or_default()
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn live_connections(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn requests(&self) -> Vec<RequestRecord> {
        self.requests.clone()
    }

    pub(crate) fn feeds(&self, room: RoomId) -> Vec<PeerId> {
        self.rooms
            .get(&room)
            .map(|feeds| feeds.keys().copied().collect())
            .unwrap_or_default()
    }
}
