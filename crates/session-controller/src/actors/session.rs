//! `SessionActor` - one local participant in one consultation room.
//!
//! Each `SessionActor`:
//! - Owns the signaling connection, the publish handle and the local stream
//! - Owns the Discovery Engine (and through it the roster)
//! - Owns the Subscription Manager and the Track Aggregator
//! - Routes every gateway event, timer tick and I/O completion through one
//!   mailbox, so handlers never run concurrently
//!
//! # Membership
//!
//! A successful `join` creates a membership: a generation number and a
//! cancellation scope (child of the actor token). Everything scheduled on
//! behalf of the membership is bound to that scope, and every completion is
//! tagged with its generation. `leave` (or a fatal failure) cancels the
//! scope and hands the membership's resources to a release task that
//! detaches them in order: subscribers, probes, local capture, publish
//! handle, connection. Release errors are logged and skipped.

use crate::config::SessionConfig;
use crate::errors::{ScError, SessionFailure};
use crate::observability::metrics;

use super::discovery::{announcements_in, Announcement, DiscoveryAction, DiscoveryEngine};
use super::mailbox::{next_scope_id, Mailbox};
use super::messages::{
    DiscoveryStatus, NegotiationState, Role, SessionMessage, SessionNotification, SessionSnapshot,
    SessionState, SubscriptionSnapshot,
};
use super::notifier::Notifier;
use super::subscription::{PollState, PollStep, SubscriptionManager};
use super::tracks::{AddOutcome, TrackAggregator, TrackPath};

use chrono::{DateTime, Utc};
use common::error::{CaptureError, GatewayError, GatewayResult};
use common::gateway::{Attachment, Gateway, GatewaySession, HandleEvent, PluginHandle};
use common::media::{LocalStream, MediaCapture, MediaConstraints, MediaTrack, TrackKind};
use common::types::{PeerId, RoomId};
use common::videoroom::{Jsep, Request, RoomEvent, SdpType, VIDEOROOM_PLUGIN};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 500;

/// Handle to a `SessionActor`.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, ScError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Join `room_id` as `display_name`.
    ///
    /// Returns once the join is under way (`Connecting`). Progress is
    /// reported through state changes; use [`Self::wait_for_state`] to wait
    /// for `Active` or `Failed`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the session is `Idle`.
    pub async fn join(
        &self,
        room_id: RoomId,
        display_name: impl Into<String>,
        role: Role,
    ) -> Result<(), ScError> {
        let display_name = display_name.into();
        self.request(|respond_to| SessionMessage::Join {
            room_id,
            display_name,
            role,
            respond_to,
        })
        .await?
    }

    /// Leave the room and release every resource. Returns after the release
    /// completed and the session is `Idle`. Safe to call in any state and
    /// any number of times; cancels an in-flight join.
    pub async fn leave(&self) -> Result<(), ScError> {
        self.request(|respond_to| SessionMessage::Leave { respond_to })
            .await?
    }

    /// Start capture and publication if the session did not publish on join.
    pub async fn publish(&self) -> Result<(), ScError> {
        self.request(|respond_to| SessionMessage::Publish { respond_to })
            .await?
    }

    /// Subscribe to a peer. A no-op if its media is already being received;
    /// otherwise any existing subscription is replaced.
    pub async fn connect_to_peer(&self, peer_id: PeerId) -> Result<(), ScError> {
        self.request(|respond_to| SessionMessage::ConnectToPeer {
            peer_id,
            respond_to,
        })
        .await?
    }

    /// Tear down the subscription to a peer and stop auto-subscribing it.
    pub async fn disconnect_from_peer(&self, peer_id: PeerId) -> Result<(), ScError> {
        self.request(|respond_to| SessionMessage::DisconnectFromPeer {
            peer_id,
            respond_to,
        })
        .await?
    }

    /// Restart the discovery sequence.
    pub async fn refresh_discovery(&self) -> Result<(), ScError> {
        self.request(|respond_to| SessionMessage::RefreshDiscovery { respond_to })
            .await?
    }

    /// Diagnostic snapshot of the session.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, ScError> {
        self.request(|respond_to| SessionMessage::GetSnapshot { respond_to })
            .await
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver following every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor exits first.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> Result<SessionState, ScError>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| predicate(s))
            .await
            .map_err(|e| ScError::Internal(format!("state channel closed: {e}")))?;
        Ok(reached.clone())
    }

    /// Cancel the actor. Membership resources are released before it exits.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Publication progress of a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publication {
    NotStarted,
    Capturing,
    Negotiating,
    Published,
    Failed,
}

/// Resources of a torn-down membership, released in order.
struct ReleasePlan {
    generation: u64,
    subscribers: Vec<(PeerId, Arc<dyn PluginHandle>)>,
    probes: Vec<Arc<dyn PluginHandle>>,
    local_stream: Option<LocalStream>,
    publisher: Option<Arc<dyn PluginHandle>>,
    connection: Option<Arc<dyn GatewaySession>>,
}

impl ReleasePlan {
    async fn execute(self) {
        let subscribers = self.subscribers.len();
        for (peer_id, handle) in self.subscribers {
            trace!(target: "sc.release", peer_id = %peer_id, "Detaching subscriber");
            release_handle(handle.as_ref(), "subscriber").await;
        }
        for probe in self.probes {
            release_handle(probe.as_ref(), "probe").await;
        }
        if let Some(stream) = self.local_stream {
            stream.stop_all();
        }
        if let Some(publisher) = self.publisher {
            release_handle(publisher.as_ref(), "publisher").await;
        }
        if let Some(connection) = self.connection {
            release_connection(connection.as_ref()).await;
        }
        info!(
            target: "sc.release",
            generation = self.generation,
            subscribers,
            "Membership resources released"
        );
    }
}

pub(super) async fn release_connection(connection: &dyn GatewaySession) {
    if let Err(e) = connection.destroy().await {
        warn!(target: "sc.release", error = %e, "Connection release failed, continuing");
        metrics::record_release_error("connection");
    }
}

pub(super) async fn release_handle(handle: &dyn PluginHandle, resource: &'static str) {
    if let Err(e) = handle.detach().await {
        warn!(
            target: "sc.release",
            resource,
            handle_id = %handle.id(),
            error = %e,
            "Detach failed, continuing"
        );
        metrics::record_release_error(resource);
    }
}

fn spawn_release(handle: Arc<dyn PluginHandle>, resource: &'static str) {
    tokio::spawn(async move {
        release_handle(handle.as_ref(), resource).await;
    });
}

/// One room membership: everything acquired between `join` and teardown.
struct Membership {
    generation: u64,
    room_id: RoomId,
    display_name: String,
    role: Role,
    auto_subscribe: bool,
    scope: CancellationToken,
    join_started: Instant,
    joined_at: Option<DateTime<Utc>>,
    mailbox: Mailbox,
    notifier: Notifier,
    capture: Arc<dyn MediaCapture>,
    connection: Option<Arc<dyn GatewaySession>>,
    publisher: Option<Arc<dyn PluginHandle>>,
    own_feed: Option<PeerId>,
    joined: bool,
    publication: Publication,
    local_stream: Option<LocalStream>,
    discovery: DiscoveryEngine,
    subscriptions: SubscriptionManager,
    tracks: TrackAggregator,
}

impl Membership {
    fn display_of(&self, peer_id: PeerId) -> String {
        self.discovery.roster().display_name(peer_id)
    }

    /// Send a request on the publish handle; failures come back as
    /// `PublisherRequestFailed`.
    fn send_on_publisher(&self, request: Request, jsep: Option<Jsep>) {
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        let generation = self.generation;
        let name = request.name();
        self.mailbox.spawn_io(async move {
            publisher
                .send(request, jsep)
                .await
                .err()
                .map(|error| SessionMessage::PublisherRequestFailed {
                    generation,
                    request: name,
                    error,
                })
        });
    }

    /// Merge announcements, report roster changes and auto-subscribe.
    fn merge(&mut self, announcements: &[Announcement]) {
        if announcements.is_empty() {
            return;
        }
        let outcome = self.discovery.merge(announcements);
        if outcome.changed {
            let roster = self.discovery.roster().participants();
            self.notifier.status(format!(
                "{} participant(s) available",
                roster.len()
            ));
            self.notifier
                .notify(SessionNotification::RosterChanged(roster));
        }
        if self.auto_subscribe {
            for peer_id in outcome.announced {
                self.ensure_subscribed(peer_id);
            }
        }
    }

    /// Subscribe unless a subscription exists or the user dismissed the peer.
    fn ensure_subscribed(&mut self, peer_id: PeerId) {
        if self.subscriptions.contains(peer_id) || self.discovery.roster().is_dismissed(peer_id) {
            return;
        }
        self.subscribe(peer_id);
    }

    /// Open a subscription. Any existing one for the peer is torn down first.
    fn subscribe(&mut self, peer_id: PeerId) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        self.unsubscribe(peer_id);

        let display = self.display_of(peer_id);
        let (subscription, _) = self.subscriptions.open(peer_id);
        self.tracks.open(peer_id, &display);
        info!(
            target: "sc.subscription",
            peer_id = %peer_id,
            subscription,
            "Subscribing to peer"
        );
        self.notifier.status(format!("Connecting to {display}..."));

        let opaque_id = format!("{}-sub-{}", self.role, Uuid::new_v4());
        self.mailbox.spawn_io(async move {
            let result = connection.attach(VIDEOROOM_PLUGIN, &opaque_id).await;
            Some(SessionMessage::SubscriberAttached {
                peer_id,
                subscription,
                result,
            })
        });
    }

    /// Tear down a peer's subscription and its track set. Idempotent.
    fn unsubscribe(&mut self, peer_id: PeerId) -> bool {
        let removed = self.subscriptions.remove(peer_id);
        self.tracks.clear(peer_id);
        self.discovery.roster_mut().set_active(peer_id, false);
        match removed {
            Some(handle) => {
                if let Some(gateway) = handle.gateway {
                    spawn_release(gateway, "subscriber");
                }
                true
            }
            None => false,
        }
    }

    fn subscription_failed(
        &mut self,
        peer_id: PeerId,
        subscription: u64,
        stage: &'static str,
        error: &GatewayError,
    ) {
        let Some(handle) = self.subscriptions.fail(peer_id, subscription, stage) else {
            return;
        };
        warn!(
            target: "sc.subscription",
            peer_id = %peer_id,
            subscription,
            stage,
            error = %error,
            "Subscription failed"
        );
        if let Some(gateway) = handle.gateway {
            spawn_release(gateway, "subscriber");
        }
        self.tracks.clear(peer_id);
        self.discovery.roster_mut().set_active(peer_id, false);
        let display = self.display_of(peer_id);
        self.notifier
            .status(format!("Could not connect to {display}: {error}"));
    }

    /// A peer left or stopped publishing.
    fn peer_left(&mut self, peer_id: PeerId) {
        if Some(peer_id) == self.own_feed {
            return;
        }
        let display = self.display_of(peer_id);
        self.unsubscribe(peer_id);
        if self.discovery.remove(peer_id).is_some() {
            info!(target: "sc.session", peer_id = %peer_id, "Peer left");
            self.notifier.status(format!("{display} left"));
            self.notifier.notify(SessionNotification::RosterChanged(
                self.discovery.roster().participants(),
            ));
        }
    }

    fn add_tracks<I>(&mut self, peer_id: PeerId, tracks: I, path: TrackPath)
    where
        I: IntoIterator<Item = MediaTrack>,
    {
        for track in tracks {
            if let AddOutcome::Added { became_ready: true } =
                self.tracks.add_track(peer_id, &track, path)
            {
                self.discovery.roster_mut().set_active(peer_id, true);
                let display = self.display_of(peer_id);
                self.notifier.status(format!("Receiving media from {display}"));
            }
        }
    }

    /// Start capture. Returns `false` if publication already started.
    fn start_publish(&mut self) -> bool {
        if !matches!(self.publication, Publication::NotStarted | Publication::Failed) {
            return false;
        }
        self.publication = Publication::Capturing;
        self.notifier.status("Starting camera...");
        let capture = Arc::clone(&self.capture);
        let constraints = self.role.capture_constraints();
        let generation = self.generation;
        self.mailbox.spawn_io(async move {
            let result = capture.acquire_local_stream(&constraints).await;
            Some(SessionMessage::LocalStreamAcquired { generation, result })
        });
        true
    }

    fn execute(&mut self, actions: Vec<DiscoveryAction>) {
        for action in actions {
            match action {
                DiscoveryAction::ListParticipants => {
                    self.send_on_publisher(Request::ListParticipants { room: self.room_id }, None);
                }
                DiscoveryAction::Ping => self.send_on_publisher(Request::Ping, None),
                DiscoveryAction::Rejoin => self.send_on_publisher(
                    Request::join_as_publisher(self.room_id, self.display_name.clone()),
                    None,
                ),
                DiscoveryAction::OpenProbe { probe, feed } => {
                    let Some(connection) = self.connection.clone() else {
                        self.discovery.probe_failed(probe);
                        continue;
                    };
                    let room = self.room_id;
                    let opaque_id = format!("probe-{}", Uuid::new_v4());
                    self.mailbox.spawn_io(async move {
                        let result = connection.attach(VIDEOROOM_PLUGIN, &opaque_id).await;
                        if let Ok(attachment) = &result {
                            // The reply (usually "no such feed") is what flushes
                            // buffered publisher events.
                            let join = Request::join_as_subscriber(room, feed);
                            if let Err(e) = attachment.handle.send(join, None).await {
                                debug!(
                                    target: "sc.discovery",
                                    probe,
                                    error = %e,
                                    "Probe join failed"
                                );
                            }
                        }
                        Some(SessionMessage::ProbeAttached { probe, result })
                    });
                }
                DiscoveryAction::DetachProbe(handle) => spawn_release(handle, "probe"),
            }
        }
    }

    fn snapshot(&self, state: SessionState) -> SessionSnapshot {
        let mut subscriptions: Vec<SubscriptionSnapshot> = self
            .subscriptions
            .iter()
            .map(|handle| SubscriptionSnapshot {
                peer_id: handle.peer_id,
                negotiation: handle.negotiation,
                audio_tracks: self.tracks.count(handle.peer_id, TrackKind::Audio),
                video_tracks: self.tracks.count(handle.peer_id, TrackKind::Video),
                ready: self.tracks.is_ready(handle.peer_id),
                polling: handle.poll == PollState::Running,
            })
            .collect();
        subscriptions.sort_by_key(|s| s.peer_id);

        SessionSnapshot {
            state,
            role: Some(self.role),
            room_id: Some(self.room_id),
            display_name: Some(self.display_name.clone()),
            own_feed: self.own_feed,
            joined_at: self.joined_at,
            local_stream: self.local_stream.is_some(),
            roster: self.discovery.roster().participants(),
            discovery: self.discovery.status(),
            subscriptions,
        }
    }

    /// Cancel every timer and forwarder and collect resources for release.
    fn teardown(mut self) -> ReleasePlan {
        self.scope.cancel();
        let subscribers = self
            .subscriptions
            .drain()
            .into_iter()
            .filter_map(|handle| handle.gateway.map(|gateway| (handle.peer_id, gateway)))
            .collect();
        self.tracks.clear_all();
        let probes = self.discovery.stop();
        ReleasePlan {
            generation: self.generation,
            subscribers,
            probes,
            local_stream: self.local_stream.take(),
            publisher: self.publisher.take(),
            connection: self.connection.take(),
        }
    }
}

/// The membership identified by `generation`, if it is still current.
fn current(slot: &mut Option<Membership>, generation: u64) -> Option<&mut Membership> {
    slot.as_mut().filter(|m| m.generation == generation)
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: String,
    config: SessionConfig,
    gateway: Arc<dyn Gateway>,
    capture: Arc<dyn MediaCapture>,
    receiver: mpsc::Receiver<SessionMessage>,
    mailbox: Mailbox,
    cancel_token: CancellationToken,
    state: watch::Sender<SessionState>,
    notifier: Notifier,
    membership: Option<Membership>,
    /// Generation whose release task is still running.
    releasing: Option<u64>,
    leave_waiters: Vec<oneshot::Sender<Result<(), ScError>>>,
    messages_processed: u64,
}

impl SessionActor {
    /// Spawn a new session actor.
    ///
    /// Returns the handle, the notification stream for the presentation
    /// layer, and the actor's task handle.
    pub fn spawn(
        config: SessionConfig,
        gateway: Arc<dyn Gateway>,
        capture: Arc<dyn MediaCapture>,
        cancel_token: CancellationToken,
    ) -> (
        SessionHandle,
        mpsc::Receiver<SessionNotification>,
        JoinHandle<()>,
    ) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (notify_tx, notifications) = mpsc::channel(config.notification_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let actor = Self {
            session_id: Uuid::new_v4().to_string(),
            config,
            gateway,
            capture,
            receiver,
            mailbox: Mailbox::new(&sender),
            cancel_token: cancel_token.clone(),
            state: state_tx,
            notifier: Notifier::new(notify_tx),
            membership: None,
            releasing: None,
            leave_waiters: Vec::new(),
            messages_processed: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            state: state_rx,
        };

        (handle, notifications, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        info!(target: "sc.session", session_id = %self.session_id, "SessionActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            trace!(
                                target: "sc.session",
                                message = message.name(),
                                "Handling message"
                            );
                            self.handle_message(message);
                            self.messages_processed += 1;
                        }
                        None => {
                            info!(
                                target: "sc.session",
                                session_id = %self.session_id,
                                "SessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown().await;

        info!(
            target: "sc.session",
            session_id = %self.session_id,
            messages_processed = self.messages_processed,
            "SessionActor stopped"
        );
    }

    /// Release the current membership inline; the actor is exiting.
    async fn shutdown(&mut self) {
        if let Some(membership) = self.membership.take() {
            membership.teardown().execute().await;
        }
        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn set_state(&mut self, state: SessionState) {
        let previous = self.current_state();
        if previous == state {
            return;
        }
        info!(
            target: "sc.session",
            session_id = %self.session_id,
            from = previous.as_str(),
            to = state.as_str(),
            "Session state changed"
        );
        metrics::record_session_transition(state.as_str());
        self.state.send_replace(state.clone());
        self.notifier
            .notify(SessionNotification::StateChanged(state));
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                room_id,
                display_name,
                role,
                respond_to,
            } => {
                let result = self.handle_join(room_id, display_name, role);
                let _ = respond_to.send(result);
            }
            SessionMessage::Leave { respond_to } => self.handle_leave(respond_to),
            SessionMessage::Publish { respond_to } => {
                let result = self.handle_publish();
                let _ = respond_to.send(result);
            }
            SessionMessage::ConnectToPeer {
                peer_id,
                respond_to,
            } => {
                let result = self.handle_connect_to_peer(peer_id);
                let _ = respond_to.send(result);
            }
            SessionMessage::DisconnectFromPeer {
                peer_id,
                respond_to,
            } => {
                let result = self.handle_disconnect_from_peer(peer_id);
                let _ = respond_to.send(result);
            }
            SessionMessage::RefreshDiscovery { respond_to } => {
                let result = self.handle_refresh_discovery();
                let _ = respond_to.send(result);
            }
            SessionMessage::GetSnapshot { respond_to } => {
                let state = self.current_state();
                let snapshot = match &self.membership {
                    Some(membership) => membership.snapshot(state),
                    None => SessionSnapshot::idle(state),
                };
                let _ = respond_to.send(snapshot);
            }

            SessionMessage::Connected { generation, result } => {
                self.on_connected(generation, result);
            }
            SessionMessage::PublisherAttached { generation, result } => {
                self.on_publisher_attached(generation, result);
            }
            SessionMessage::PublisherEvent { generation, event } => {
                self.on_publisher_event(generation, event);
            }
            SessionMessage::PublisherRequestFailed {
                generation,
                request,
                error,
            } => self.on_publisher_request_failed(generation, request, &error),
            SessionMessage::JoinTimeout { generation } => {
                if current(&mut self.membership, generation).is_some_and(|m| !m.joined) {
                    self.fail(SessionFailure::JoinTimedOut);
                }
            }
            SessionMessage::LocalStreamAcquired { generation, result } => {
                self.on_local_stream(generation, result);
            }
            SessionMessage::PublishNegotiated { generation, result } => {
                self.on_publish_negotiated(generation, result);
            }
            SessionMessage::Released { generation } => self.on_released(generation),

            SessionMessage::DiscoveryTick { run, attempt } => {
                if let Some(m) = self.membership.as_mut() {
                    let actions = m.discovery.on_tick(run, attempt);
                    m.execute(actions);
                }
            }
            SessionMessage::DiscoveryPing { run } => {
                if let Some(m) = self.membership.as_mut() {
                    let actions = m.discovery.on_ping(run).into_iter().collect();
                    m.execute(actions);
                }
            }
            SessionMessage::DiscoveryRejoin { run } => {
                if let Some(m) = self.membership.as_mut() {
                    let actions = m.discovery.on_rejoin(run).into_iter().collect();
                    m.execute(actions);
                }
            }
            SessionMessage::ProbeAttached { probe, result } => {
                self.on_probe_attached(probe, result);
            }
            SessionMessage::ProbeEvent { probe, event } => self.on_probe_event(probe, event),
            SessionMessage::ProbeExpired { probe } => {
                if let Some(m) = self.membership.as_mut() {
                    let actions = m.discovery.expire_probe(probe).into_iter().collect();
                    m.execute(actions);
                }
            }

            SessionMessage::SubscriberAttached {
                peer_id,
                subscription,
                result,
            } => self.on_subscriber_attached(peer_id, subscription, result),
            SessionMessage::SubscriberEvent {
                peer_id,
                subscription,
                event,
            } => self.on_subscriber_event(peer_id, subscription, event),
            SessionMessage::AnswerSent {
                peer_id,
                subscription,
                result,
            } => self.on_answer_sent(peer_id, subscription, result),
            SessionMessage::SubscriptionFailed {
                peer_id,
                subscription,
                stage,
                error,
            } => {
                if let Some(m) = self.membership.as_mut() {
                    m.subscription_failed(peer_id, subscription, stage, &error);
                }
            }
            SessionMessage::TrackPoll {
                peer_id,
                subscription,
                check,
            } => self.on_track_poll(peer_id, subscription, check),
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_join(
        &mut self,
        room_id: RoomId,
        display_name: String,
        role: Role,
    ) -> Result<(), ScError> {
        let state = self.current_state();
        if state != SessionState::Idle {
            return Err(ScError::InvalidState {
                operation: "join",
                state: state.as_str(),
            });
        }

        let generation = next_scope_id();
        let scope = self.cancel_token.child_token();
        let auto_subscribe = self
            .config
            .auto_subscribe
            .unwrap_or_else(|| role.auto_subscribes());

        info!(
            target: "sc.session",
            session_id = %self.session_id,
            room_id = %room_id,
            role = role.as_str(),
            generation,
            auto_subscribe,
            "Joining room"
        );

        self.membership = Some(Membership {
            generation,
            room_id,
            display_name,
            role,
            auto_subscribe,
            scope: scope.clone(),
            join_started: Instant::now(),
            joined_at: None,
            mailbox: self.mailbox.clone(),
            notifier: self.notifier.clone(),
            capture: Arc::clone(&self.capture),
            connection: None,
            publisher: None,
            own_feed: None,
            joined: false,
            publication: Publication::NotStarted,
            local_stream: None,
            discovery: DiscoveryEngine::new(
                self.config.discovery.clone(),
                self.mailbox.clone(),
                self.notifier.clone(),
                scope.clone(),
            ),
            subscriptions: SubscriptionManager::new(
                self.config.track_poll.clone(),
                self.mailbox.clone(),
                scope,
            ),
            tracks: TrackAggregator::new(self.notifier.clone()),
        });

        self.set_state(SessionState::Connecting);
        self.notifier.status("Connecting to video service...");

        let gateway = Arc::clone(&self.gateway);
        self.mailbox.spawn_io(async move {
            let result = gateway.connect().await;
            Some(SessionMessage::Connected { generation, result })
        });
        Ok(())
    }

    fn handle_leave(&mut self, respond_to: oneshot::Sender<Result<(), ScError>>) {
        match self.current_state() {
            SessionState::Idle => {
                let _ = respond_to.send(Ok(()));
            }
            SessionState::Leaving => self.leave_waiters.push(respond_to),
            _ => {
                self.leave_waiters.push(respond_to);
                self.set_state(SessionState::Leaving);
                self.notifier.status("Leaving room...");
                self.begin_release();
                if self.releasing.is_none() {
                    self.finish_leave();
                }
            }
        }
    }

    fn finish_leave(&mut self) {
        self.set_state(SessionState::Idle);
        self.notifier.status("Left room");
        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn handle_publish(&mut self) -> Result<(), ScError> {
        let state = self.current_state();
        let Some(m) = self.membership.as_mut().filter(|m| m.joined) else {
            return Err(ScError::NotJoined);
        };
        if state != SessionState::Active {
            // Joined or already publishing: publication is under way.
            return Ok(());
        }
        if m.start_publish() {
            self.set_state(SessionState::Publishing);
        }
        Ok(())
    }

    fn handle_connect_to_peer(&mut self, peer_id: PeerId) -> Result<(), ScError> {
        let Some(m) = self.membership.as_mut().filter(|m| m.joined) else {
            return Err(ScError::NotJoined);
        };
        if !m.discovery.roster().contains(peer_id) {
            return Err(ScError::UnknownPeer(peer_id.0));
        }
        m.discovery.roster_mut().set_dismissed(peer_id, false);
        if m.tracks.is_ready(peer_id) {
            debug!(target: "sc.subscription", peer_id = %peer_id, "Already receiving media");
            return Ok(());
        }
        m.subscribe(peer_id);
        Ok(())
    }

    fn handle_disconnect_from_peer(&mut self, peer_id: PeerId) -> Result<(), ScError> {
        let Some(m) = self.membership.as_mut().filter(|m| m.joined) else {
            return Err(ScError::NotJoined);
        };
        m.discovery.roster_mut().set_dismissed(peer_id, true);
        if m.unsubscribe(peer_id) {
            info!(target: "sc.subscription", peer_id = %peer_id, "Disconnected from peer");
            let display = m.display_of(peer_id);
            m.notifier.status(format!("Disconnected from {display}"));
        }
        Ok(())
    }

    fn handle_refresh_discovery(&mut self) -> Result<(), ScError> {
        let Some(m) = self.membership.as_mut().filter(|m| m.joined) else {
            return Err(ScError::NotJoined);
        };
        m.notifier.status("Searching for participants...");
        m.discovery.start(true);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership lifecycle
    // ------------------------------------------------------------------

    fn on_connected(&mut self, generation: u64, result: GatewayResult<Arc<dyn GatewaySession>>) {
        let Some(m) = current(&mut self.membership, generation) else {
            if let Ok(connection) = result {
                tokio::spawn(async move {
                    release_connection(connection.as_ref()).await;
                });
            }
            return;
        };
        match result {
            Err(e) => {
                warn!(target: "sc.session", error = %e, "Gateway connection failed");
                self.fail(SessionFailure::GatewayUnreachable(e.to_string()));
            }
            Ok(connection) => {
                m.connection = Some(Arc::clone(&connection));
                m.notifier
                    .status(format!("Connected, joining room {}...", m.room_id));
                let opaque_id = format!("{}-{}", m.role, Uuid::new_v4());
                m.mailbox.spawn_io(async move {
                    let result = connection.attach(VIDEOROOM_PLUGIN, &opaque_id).await;
                    Some(SessionMessage::PublisherAttached { generation, result })
                });
            }
        }
    }

    fn on_publisher_attached(&mut self, generation: u64, result: GatewayResult<Attachment>) {
        let Some(m) = current(&mut self.membership, generation) else {
            if let Ok(attachment) = result {
                spawn_release(attachment.handle, "publisher");
            }
            return;
        };
        match result {
            Err(e) => {
                warn!(target: "sc.session", error = %e, "Publish handle attach failed");
                self.fail(SessionFailure::AttachFailed(e.to_string()));
            }
            Ok(Attachment { handle, events }) => {
                debug!(target: "sc.session", handle_id = %handle.id(), "Publish handle attached");
                m.publisher = Some(handle);
                m.mailbox.forward_events(&m.scope, events, move |event| {
                    SessionMessage::PublisherEvent { generation, event }
                });
                m.send_on_publisher(
                    Request::join_as_publisher(m.room_id, m.display_name.clone()),
                    None,
                );
                m.mailbox.schedule(
                    &m.scope,
                    self.config.join_timeout,
                    SessionMessage::JoinTimeout { generation },
                );
                self.set_state(SessionState::Joining);
            }
        }
    }

    fn on_publisher_event(&mut self, generation: u64, event: HandleEvent) {
        if current(&mut self.membership, generation).is_none() {
            return;
        }
        match event {
            HandleEvent::Message { event, jsep } => {
                self.on_publisher_message(generation, &event, jsep);
            }
            HandleEvent::TransportState { up } => {
                debug!(target: "sc.session", up, "Publisher transport state changed");
            }
            HandleEvent::Cleanup => {
                debug!(target: "sc.session", "Publisher media released by gateway");
            }
            HandleEvent::Track { .. } | HandleEvent::RemoteStream(_) => {
                trace!(target: "sc.session", "Ignoring media event on publish handle");
            }
        }
    }

    fn on_publisher_message(&mut self, generation: u64, event: &RoomEvent, jsep: Option<Jsep>) {
        let Some(m) = current(&mut self.membership, generation) else {
            return;
        };

        if let Some(answer) = jsep.filter(|j| j.kind == SdpType::Answer) {
            if let Some(publisher) = m.publisher.clone() {
                m.mailbox.spawn_io(async move {
                    let result = publisher.handle_remote_jsep(&answer).await;
                    Some(SessionMessage::PublishNegotiated { generation, result })
                });
            }
        }

        match event {
            RoomEvent::Joined { id, .. } => {
                let announcements = announcements_in(event, Some(*id));
                if m.joined {
                    debug!(target: "sc.session", "Duplicate join confirmation");
                    m.merge(&announcements);
                    return;
                }
                m.joined = true;
                m.joined_at = Some(Utc::now());
                m.own_feed = Some(*id);
                metrics::record_join_duration(m.join_started.elapsed());
                info!(
                    target: "sc.session",
                    room_id = %m.room_id,
                    feed = %id,
                    publishers = announcements.len(),
                    "Joined room"
                );
                m.notifier
                    .status(format!("Joined room {} as {}", m.room_id, m.display_name));
                m.merge(&announcements);
                let publish = m.role.publishes_on_join();

                self.set_state(SessionState::Joined);
                if publish {
                    if let Some(m) = current(&mut self.membership, generation) {
                        m.start_publish();
                    }
                    self.set_state(SessionState::Publishing);
                } else {
                    self.enter_active(generation);
                }
            }
            RoomEvent::Event(body) => {
                if let Some(code) = body.error_code {
                    let reason = body.error.clone().unwrap_or_default();
                    if m.joined {
                        warn!(
                            target: "sc.session",
                            code,
                            reason = %reason,
                            "Ignoring gateway error after join"
                        );
                    } else {
                        self.fail(SessionFailure::JoinRejected { code, reason });
                    }
                    return;
                }
                m.merge(&announcements_in(event, m.own_feed));
                for peer_id in [body.unpublished, body.leaving].into_iter().flatten() {
                    m.peer_left(peer_id);
                }
                if body.configured.is_some() {
                    debug!(target: "sc.session", "Publisher configured");
                }
            }
            RoomEvent::Participants { .. } => {
                m.merge(&announcements_in(event, m.own_feed));
            }
            RoomEvent::Attached { .. } => {}
        }
    }

    fn on_publisher_request_failed(
        &mut self,
        generation: u64,
        request: &'static str,
        error: &GatewayError,
    ) {
        let Some(m) = current(&mut self.membership, generation) else {
            return;
        };
        match request {
            "join" if !m.joined => {
                self.fail(SessionFailure::JoinRequestFailed(error.to_string()));
            }
            "configure" => {
                warn!(target: "sc.session", error = %error, "Publishing failed");
                m.publication = Publication::Failed;
                m.notifier.status(format!("Publishing failed: {error}"));
                self.enter_active(generation);
            }
            _ => {
                debug!(
                    target: "sc.session",
                    request,
                    error = %error,
                    "Publisher request failed"
                );
            }
        }
    }

    fn on_local_stream(&mut self, generation: u64, result: Result<LocalStream, CaptureError>) {
        let Some(m) = current(&mut self.membership, generation) else {
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        };
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "sc.session", error = %e, "Local capture failed");
                m.publication = Publication::Failed;
                m.notifier.status(format!("Camera unavailable: {e}"));
                self.enter_active(generation);
                return;
            }
        };
        let Some(publisher) = m.publisher.clone() else {
            stream.stop_all();
            return;
        };

        m.local_stream = Some(stream.clone());
        m.publication = Publication::Negotiating;
        m.notifier
            .notify(SessionNotification::LocalStreamReady(stream.clone()));
        m.notifier.status("Camera started, publishing...");

        let configure = Request::Configure {
            audio: stream.has_kind(TrackKind::Audio),
            video: stream.has_kind(TrackKind::Video),
        };
        m.mailbox.spawn_io(async move {
            let sent = match publisher
                .create_offer(&stream, MediaConstraints::send_only())
                .await
            {
                Ok(offer) => publisher.send(configure, Some(offer)).await,
                Err(e) => Err(e),
            };
            sent.err().map(|error| SessionMessage::PublisherRequestFailed {
                generation,
                request: "configure",
                error,
            })
        });
    }

    fn on_publish_negotiated(&mut self, generation: u64, result: GatewayResult<()>) {
        let Some(m) = current(&mut self.membership, generation) else {
            return;
        };
        match result {
            Ok(()) => {
                if m.publication == Publication::Negotiating {
                    info!(target: "sc.session", room_id = %m.room_id, "Publishing");
                    m.publication = Publication::Published;
                    m.notifier.status("Publishing audio and video");
                }
            }
            Err(e) => {
                warn!(target: "sc.session", error = %e, "Applying publisher answer failed");
                m.publication = Publication::Failed;
                m.notifier.status(format!("Publishing failed: {e}"));
            }
        }
        self.enter_active(generation);
    }

    /// Enter `Active` from `Joined` or `Publishing`; starts discovery the
    /// first time.
    fn enter_active(&mut self, generation: u64) {
        if !matches!(
            self.current_state(),
            SessionState::Joined | SessionState::Publishing
        ) {
            return;
        }
        let Some(m) = current(&mut self.membership, generation) else {
            return;
        };
        if m.discovery.status() == DiscoveryStatus::Idle {
            m.discovery.start(false);
        }
        self.set_state(SessionState::Active);
    }

    /// Fatal failure: release the membership and stay `Failed` until
    /// `leave()`.
    fn fail(&mut self, failure: SessionFailure) {
        warn!(
            target: "sc.session",
            session_id = %self.session_id,
            cause = failure.as_str(),
            error = %failure,
            "Session failed"
        );
        self.notifier.status(format!("Error: {failure}"));
        self.set_state(SessionState::Failed(failure));
        self.begin_release();
    }

    /// Tear down the membership and release its resources in the background.
    fn begin_release(&mut self) {
        let Some(membership) = self.membership.take() else {
            return;
        };
        let plan = membership.teardown();
        let generation = plan.generation;
        self.releasing = Some(generation);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            plan.execute().await;
            mailbox.post(SessionMessage::Released { generation }).await;
        });
    }

    fn on_released(&mut self, generation: u64) {
        if self.releasing != Some(generation) {
            return;
        }
        self.releasing = None;
        if self.current_state() == SessionState::Leaving {
            self.finish_leave();
        }
    }

    // ------------------------------------------------------------------
    // Discovery probes
    // ------------------------------------------------------------------

    fn on_probe_attached(&mut self, probe: u64, result: GatewayResult<Attachment>) {
        let Some(m) = self.membership.as_mut() else {
            if let Ok(attachment) = result {
                spawn_release(attachment.handle, "probe");
            }
            return;
        };
        match result {
            Err(e) => {
                debug!(target: "sc.discovery", probe, error = %e, "Probe attach failed");
                m.discovery.probe_failed(probe);
            }
            Ok(Attachment { handle, events }) => {
                if m.discovery.probe_attached(probe, Arc::clone(&handle)) {
                    m.mailbox.forward_events(&m.scope, events, move |event| {
                        SessionMessage::ProbeEvent { probe, event }
                    });
                } else {
                    spawn_release(handle, "probe");
                }
            }
        }
    }

    fn on_probe_event(&mut self, probe: u64, event: HandleEvent) {
        let Some(m) = self.membership.as_mut() else {
            return;
        };
        if !m.discovery.has_probe(probe) {
            return;
        }
        if let HandleEvent::Message { event, .. } = event {
            let announcements = announcements_in(&event, m.own_feed);
            debug!(
                target: "sc.discovery",
                probe,
                announced = announcements.len(),
                "Probe reply"
            );
            m.merge(&announcements);
            m.discovery.probe_replied(probe);
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    fn on_subscriber_attached(
        &mut self,
        peer_id: PeerId,
        subscription: u64,
        result: GatewayResult<Attachment>,
    ) {
        let Some(m) = self
            .membership
            .as_mut()
            .filter(|m| m.subscriptions.is_current(peer_id, subscription))
        else {
            if let Ok(attachment) = result {
                debug!(
                    target: "sc.subscription",
                    peer_id = %peer_id,
                    subscription,
                    "Releasing attachment of a replaced subscription"
                );
                spawn_release(attachment.handle, "subscriber");
            }
            return;
        };
        let Attachment { handle, events } = match result {
            Ok(attachment) => attachment,
            Err(e) => {
                m.subscription_failed(peer_id, subscription, "attach", &e);
                return;
            }
        };

        let room = m.room_id;
        let Some(entry) = m.subscriptions.current_mut(peer_id, subscription) else {
            return;
        };
        entry.gateway = Some(Arc::clone(&handle));
        entry.negotiation = NegotiationState::AwaitingOffer;
        let scope = entry.scope.clone();

        m.mailbox.forward_events(&scope, events, move |event| {
            SessionMessage::SubscriberEvent {
                peer_id,
                subscription,
                event,
            }
        });
        m.mailbox.spawn_io(async move {
            handle
                .send(Request::join_as_subscriber(room, peer_id), None)
                .await
                .err()
                .map(|error| SessionMessage::SubscriptionFailed {
                    peer_id,
                    subscription,
                    stage: "join",
                    error,
                })
        });
    }

    fn on_subscriber_event(&mut self, peer_id: PeerId, subscription: u64, event: HandleEvent) {
        let Some(m) = self
            .membership
            .as_mut()
            .filter(|m| m.subscriptions.is_current(peer_id, subscription))
        else {
            return;
        };
        match event {
            HandleEvent::Message { event, jsep } => {
                Self::on_subscriber_message(m, peer_id, subscription, &event, jsep);
            }
            HandleEvent::TransportState { up } => {
                debug!(
                    target: "sc.subscription",
                    peer_id = %peer_id,
                    up,
                    "Subscriber transport state changed"
                );
                if up && m.tracks.len(peer_id) == 0 {
                    m.subscriptions.start_polling(peer_id);
                }
            }
            HandleEvent::Track { track, streams } => {
                m.add_tracks(peer_id, track, TrackPath::TrackEvent);
                for stream in streams {
                    m.add_tracks(peer_id, stream.tracks, TrackPath::StreamEvent);
                }
            }
            HandleEvent::RemoteStream(stream) => {
                m.add_tracks(peer_id, stream.tracks, TrackPath::RemoteStream);
            }
            HandleEvent::Cleanup => {
                info!(
                    target: "sc.subscription",
                    peer_id = %peer_id,
                    "Gateway cleaned up subscriber"
                );
                m.unsubscribe(peer_id);
            }
        }
    }

    fn on_subscriber_message(
        m: &mut Membership,
        peer_id: PeerId,
        subscription: u64,
        event: &RoomEvent,
        jsep: Option<Jsep>,
    ) {
        if let RoomEvent::Event(body) = event {
            if let Some(code) = body.error_code {
                let reason = body.error.clone().unwrap_or_default();
                let error = GatewayError::Negotiation(format!("{code}: {reason}"));
                m.subscription_failed(peer_id, subscription, "join", &error);
                return;
            }
            if [body.unpublished, body.leaving]
                .into_iter()
                .flatten()
                .any(|left| left == peer_id)
            {
                m.peer_left(peer_id);
                return;
            }
            if body.started.is_some() {
                debug!(target: "sc.subscription", peer_id = %peer_id, "Subscriber started");
            }
        }

        let Some(offer) = jsep.filter(|j| j.kind == SdpType::Offer) else {
            return;
        };
        let room = m.room_id;
        let Some(entry) = m.subscriptions.current_mut(peer_id, subscription) else {
            return;
        };
        let Some(handle) = entry.gateway.clone() else {
            return;
        };
        entry.negotiation = NegotiationState::Answering;
        m.mailbox.spawn_io(async move {
            let result = match handle
                .create_answer(&offer, MediaConstraints::receive_only())
                .await
            {
                Ok(answer) => handle.send(Request::Start { room }, Some(answer)).await,
                Err(e) => Err(e),
            };
            Some(SessionMessage::AnswerSent {
                peer_id,
                subscription,
                result,
            })
        });
    }

    fn on_answer_sent(&mut self, peer_id: PeerId, subscription: u64, result: GatewayResult<()>) {
        let Some(m) = self.membership.as_mut() else {
            return;
        };
        if let Err(e) = result {
            m.subscription_failed(peer_id, subscription, "answer", &e);
            return;
        }
        let Some(entry) = m.subscriptions.current_mut(peer_id, subscription) else {
            return;
        };
        entry.negotiation = NegotiationState::Started;
        let display = m.display_of(peer_id);
        m.notifier
            .status(format!("Waiting for media from {display}..."));
        m.subscriptions.start_polling(peer_id);
    }

    fn on_track_poll(&mut self, peer_id: PeerId, subscription: u64, check: u32) {
        let Some(m) = self.membership.as_mut() else {
            return;
        };
        let Some(receivers) = m
            .subscriptions
            .get(peer_id)
            .filter(|entry| entry.id == subscription)
            .map(|entry| {
                entry
                    .gateway
                    .as_ref()
                    .map(|gateway| gateway.receivers())
                    .unwrap_or_default()
            })
        else {
            return;
        };
        m.add_tracks(peer_id, receivers, TrackPath::ReceiverPoll);

        let has_tracks = m.tracks.len(peer_id) > 0;
        trace!(target: "sc.tracks", peer_id = %peer_id, check, has_tracks, "Receiver poll");
        let step = m.subscriptions.poll_step(peer_id, subscription, check, has_tracks);
        if step == PollStep::Exhausted {
            info!(
                target: "sc.tracks",
                peer_id = %peer_id,
                checks = check,
                "No media received"
            );
            let display = m.display_of(peer_id);
            m.notifier
                .notify(SessionNotification::NoMediaReceived { peer_id });
            m.notifier
                .status(format!("No media received from {display}"));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::media::CaptureConstraints;

    struct UnreachableGateway;

    #[async_trait]
    impl Gateway for UnreachableGateway {
        async fn connect(&self) -> GatewayResult<Arc<dyn GatewaySession>> {
            Err(GatewayError::Unreachable("connection refused".to_string()))
        }
    }

    /// Gateway whose connect never completes.
    struct StalledGateway;

    #[async_trait]
    impl Gateway for StalledGateway {
        async fn connect(&self) -> GatewayResult<Arc<dyn GatewaySession>> {
            std::future::pending().await
        }
    }

    struct NoCamera;

    #[async_trait]
    impl MediaCapture for NoCamera {
        async fn acquire_local_stream(
            &self,
            _constraints: &CaptureConstraints,
        ) -> Result<LocalStream, CaptureError> {
            Err(CaptureError::PermissionDenied)
        }
    }

    fn spawn_with(
        gateway: Arc<dyn Gateway>,
    ) -> (SessionHandle, mpsc::Receiver<SessionNotification>, JoinHandle<()>) {
        SessionActor::spawn(
            SessionConfig::default(),
            gateway,
            Arc::new(NoCamera),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_unreachable_gateway_fails_session() {
        let (handle, _notifications, _task) = spawn_with(Arc::new(UnreachableGateway));

        handle.join(RoomId(42), "Patient", Role::Patient).await.unwrap();
        let state = handle
            .wait_for_state(|s| matches!(s, SessionState::Failed(_)))
            .await
            .unwrap();
        assert!(matches!(
            state,
            SessionState::Failed(SessionFailure::GatewayUnreachable(_))
        ));

        // Failed is terminal: no automatic retry, join refused until leave.
        let err = handle.join(RoomId(42), "Patient", Role::Patient).await;
        assert!(matches!(err, Err(ScError::InvalidState { operation: "join", .. })));

        handle.leave().await.unwrap();
        assert_eq!(handle.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_leave_cancels_in_flight_join() {
        let (handle, _notifications, _task) = spawn_with(Arc::new(StalledGateway));

        handle.join(RoomId(42), "Dr. Who", Role::Doctor).await.unwrap();
        assert_eq!(handle.state(), SessionState::Connecting);

        handle.leave().await.unwrap();
        assert_eq!(handle.state(), SessionState::Idle);
        handle.leave().await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot, SessionSnapshot::idle(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_commands_require_membership() {
        let (handle, _notifications, _task) = spawn_with(Arc::new(StalledGateway));

        assert!(matches!(
            handle.connect_to_peer(PeerId(7)).await,
            Err(ScError::NotJoined)
        ));
        assert!(matches!(
            handle.refresh_discovery().await,
            Err(ScError::NotJoined)
        ));
        assert!(matches!(handle.publish().await, Err(ScError::NotJoined)));
    }

    #[tokio::test]
    async fn test_cancel_stops_actor() {
        let (handle, _notifications, task) = spawn_with(Arc::new(StalledGateway));
        handle.join(RoomId(1), "Dr. Who", Role::Doctor).await.unwrap();

        handle.cancel();
        task.await.unwrap();
        assert!(handle.is_cancelled());
        assert!(matches!(handle.leave().await, Err(ScError::Internal(_))));
    }
}
