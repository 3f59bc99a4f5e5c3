//! Discovery Engine: converge on the set of publishing peers.
//!
//! The gateway may announce publishers in the join confirmation, in later
//! room events, in participant-list responses, or not at all. The engine
//! merges every announcement into the [`Roster`] by peer id and, while the
//! roster is empty, runs a bounded attempt sequence:
//!
//! ```text
//! attempt k (every `interval`, first after `initial_delay`)
//! ├── request the participant list
//! ├── ping after `ping_delay` to flush buffered events
//! ├── k == rejoin_attempt: re-issue the join after `rejoin_delay`
//! └── k >= probe_after_attempt and roster empty: open a throwaway
//!     subscriber attachment to a feed that does not exist
//! ```
//!
//! The sequence stops at the first announcement (remaining attempts are
//! cancelled) or after `max_attempts`, reporting "no peers found".
//!
//! The engine performs no gateway I/O. It schedules its own timers and
//! returns [`DiscoveryAction`]s for the session to execute, so the probe
//! heuristic stays behind this interface.

use super::mailbox::{next_scope_id, Mailbox};
use super::messages::{DiscoveryStatus, RemoteParticipant, SessionMessage, SessionNotification};
use super::notifier::Notifier;
use crate::config::DiscoveryConfig;
use crate::observability::metrics;

use common::gateway::PluginHandle;
use common::types::PeerId;
use common::videoroom::{ParticipantInfo, PublisherInfo, RoomEvent};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A normalized peer announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Announcement {
    pub(crate) peer_id: PeerId,
    pub(crate) display_name: String,
}

impl Announcement {
    fn new(peer_id: PeerId, display: Option<&str>) -> Self {
        let display_name = match display {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => peer_id.fallback_display_name(),
        };
        Self {
            peer_id,
            display_name,
        }
    }
}

fn from_publishers(publishers: &[PublisherInfo], own_feed: Option<PeerId>) -> Vec<Announcement> {
    publishers
        .iter()
        .filter(|p| Some(p.id) != own_feed)
        .map(|p| Announcement::new(p.id, p.display.as_deref()))
        .collect()
}

fn from_participants(
    participants: &[ParticipantInfo],
    own_feed: Option<PeerId>,
) -> Vec<Announcement> {
    participants
        .iter()
        .filter(|p| p.publisher && Some(p.id) != own_feed)
        .map(|p| Announcement::new(p.id, p.display.as_deref()))
        .collect()
}

/// Extract every publisher announcement carried by a room event.
pub(crate) fn announcements_in(event: &RoomEvent, own_feed: Option<PeerId>) -> Vec<Announcement> {
    match event {
        RoomEvent::Joined { publishers, .. } => from_publishers(publishers, own_feed),
        RoomEvent::Participants { participants, .. } => from_participants(participants, own_feed),
        RoomEvent::Event(body) => {
            let mut found = from_publishers(&body.publishers, own_feed);
            if let Some(participants) = &body.participants {
                found.extend(from_participants(participants, own_feed));
            }
            found
        }
        RoomEvent::Attached { .. } => Vec::new(),
    }
}

/// Effect of merging one announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeChange {
    Added,
    Renamed,
    Unchanged,
}

/// Known peers keyed by id.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    peers: BTreeMap<PeerId, RemoteParticipant>,
}

impl Roster {
    /// Union by peer id; an existing entry is updated in place.
    pub(crate) fn merge(&mut self, announcement: &Announcement) -> MergeChange {
        match self.peers.get_mut(&announcement.peer_id) {
            Some(existing) => {
                existing.publishing = true;
                if existing.display_name == announcement.display_name {
                    MergeChange::Unchanged
                } else {
                    existing
                        .display_name
                        .clone_from(&announcement.display_name);
                    MergeChange::Renamed
                }
            }
            None => {
                self.peers.insert(
                    announcement.peer_id,
                    RemoteParticipant {
                        peer_id: announcement.peer_id,
                        display_name: announcement.display_name.clone(),
                        publishing: true,
                        active: false,
                        dismissed: false,
                    },
                );
                MergeChange::Added
            }
        }
    }

    pub(crate) fn remove(&mut self, peer_id: PeerId) -> Option<RemoteParticipant> {
        self.peers.remove(&peer_id)
    }

    pub(crate) fn get(&self, peer_id: PeerId) -> Option<&RemoteParticipant> {
        self.peers.get(&peer_id)
    }

    pub(crate) fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    /// Display name of a peer, falling back to its id prefix.
    pub(crate) fn display_name(&self, peer_id: PeerId) -> String {
        self.peers
            .get(&peer_id)
            .map_or_else(|| peer_id.fallback_display_name(), |p| p.display_name.clone())
    }

    pub(crate) fn set_active(&mut self, peer_id: PeerId, active: bool) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.active = active;
        }
    }

    pub(crate) fn set_dismissed(&mut self, peer_id: PeerId, dismissed: bool) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.dismissed = dismissed;
        }
    }

    pub(crate) fn is_dismissed(&self, peer_id: PeerId) -> bool {
        self.peers.get(&peer_id).is_some_and(|p| p.dismissed)
    }

    pub(crate) fn participants(&self) -> Vec<RemoteParticipant> {
        self.peers.values().cloned().collect()
    }
}

/// Gateway work requested by the engine.
pub(crate) enum DiscoveryAction {
    /// Ask the room for its participant list.
    ListParticipants,
    /// Liveness probe on the publish handle.
    Ping,
    /// Re-issue the publisher join.
    Rejoin,
    /// Attach a throwaway subscriber and join it to `feed`.
    OpenProbe { probe: u64, feed: PeerId },
    /// Release a probe attachment.
    DetachProbe(Arc<dyn PluginHandle>),
}

impl fmt::Debug for DiscoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryAction::ListParticipants => f.write_str("ListParticipants"),
            DiscoveryAction::Ping => f.write_str("Ping"),
            DiscoveryAction::Rejoin => f.write_str("Rejoin"),
            DiscoveryAction::OpenProbe { probe, feed } => f
                .debug_struct("OpenProbe")
                .field("probe", probe)
                .field("feed", feed)
                .finish(),
            DiscoveryAction::DetachProbe(handle) => {
                f.debug_tuple("DetachProbe").field(&handle.id()).finish()
            }
        }
    }
}

/// Result of merging a batch of announcements.
#[derive(Debug, Default)]
pub(crate) struct MergeOutcome {
    /// Every peer in the batch, in announcement order.
    pub(crate) announced: Vec<PeerId>,
    /// Whether any roster entry was added or renamed.
    pub(crate) changed: bool,
}

struct Run {
    id: u64,
    scope: CancellationToken,
    /// All attempts sent; only the last attempt's ping or re-join may still
    /// be pending.
    finished: bool,
}

struct Probe {
    handle: Option<Arc<dyn PluginHandle>>,
    replied: bool,
}

/// Roster owner and bounded discovery sequence for one membership.
pub(crate) struct DiscoveryEngine {
    config: DiscoveryConfig,
    mailbox: Mailbox,
    notifier: Notifier,
    /// Membership scope; each run gets a child token.
    scope: CancellationToken,
    roster: Roster,
    run: Option<Run>,
    status: DiscoveryStatus,
    probes: HashMap<u64, Probe>,
}

impl DiscoveryEngine {
    pub(crate) fn new(
        config: DiscoveryConfig,
        mailbox: Mailbox,
        notifier: Notifier,
        scope: CancellationToken,
    ) -> Self {
        Self {
            config,
            mailbox,
            notifier,
            scope,
            roster: Roster::default(),
            run: None,
            status: DiscoveryStatus::Idle,
            probes: HashMap::new(),
        }
    }

    pub(crate) fn roster(&self) -> &Roster {
        &self.roster
    }

    pub(crate) fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    pub(crate) fn status(&self) -> DiscoveryStatus {
        self.status
    }

    pub(crate) fn probe_feed(&self) -> PeerId {
        PeerId(self.config.probe_feed)
    }

    /// Start a new attempt sequence, cancelling any current one.
    ///
    /// Without `force`, a non-empty roster converges immediately and no
    /// attempt is sent. Returns whether a sequence was started.
    pub(crate) fn start(&mut self, force: bool) -> bool {
        self.cancel_run();

        if !force && !self.roster.is_empty() {
            self.status = DiscoveryStatus::Converged { attempts: 0 };
            metrics::record_discovery_outcome("converged");
            info!(
                target: "sc.discovery",
                peers = self.roster.len(),
                "Roster already known, discovery converged without attempts"
            );
            return false;
        }

        let run = Run {
            id: next_scope_id(),
            scope: self.scope.child_token(),
            finished: false,
        };
        self.mailbox.schedule(
            &run.scope,
            self.config.initial_delay,
            SessionMessage::DiscoveryTick {
                run: run.id,
                attempt: 1,
            },
        );
        info!(
            target: "sc.discovery",
            run = run.id,
            max_attempts = self.config.max_attempts,
            forced = force,
            "Discovery started"
        );
        self.run = Some(run);
        self.status = DiscoveryStatus::Running { attempt: 0 };
        true
    }

    fn current_run(&self, run: u64) -> Option<&Run> {
        self.run.as_ref().filter(|r| r.id == run)
    }

    /// Execute attempt `attempt` of run `run`.
    pub(crate) fn on_tick(&mut self, run: u64, attempt: u32) -> Vec<DiscoveryAction> {
        let Some(current) = self.current_run(run) else {
            return Vec::new();
        };
        if current.finished {
            return Vec::new();
        }
        let scope = current.scope.clone();

        self.status = DiscoveryStatus::Running { attempt };
        metrics::record_discovery_attempt();
        debug!(
            target: "sc.discovery",
            run,
            attempt,
            max_attempts = self.config.max_attempts,
            "Discovery attempt"
        );

        let mut actions = vec![DiscoveryAction::ListParticipants];
        self.mailbox.schedule(
            &scope,
            self.config.ping_delay,
            SessionMessage::DiscoveryPing { run },
        );

        if self.config.rejoin_attempt == Some(attempt) {
            self.mailbox.schedule(
                &scope,
                self.config.rejoin_delay,
                SessionMessage::DiscoveryRejoin { run },
            );
        }

        let probe_due = self
            .config
            .probe_after_attempt
            .is_some_and(|first| attempt >= first);
        if probe_due && self.roster.is_empty() {
            let probe = next_scope_id();
            self.probes.insert(
                probe,
                Probe {
                    handle: None,
                    replied: false,
                },
            );
            metrics::record_discovery_probe("opened");
            debug!(target: "sc.discovery", run, attempt, probe, "Opening publisher-list probe");
            actions.push(DiscoveryAction::OpenProbe {
                probe,
                feed: self.probe_feed(),
            });
        }

        if attempt >= self.config.max_attempts {
            self.finish_run(attempt);
        } else {
            self.mailbox.schedule(
                &scope,
                self.config.interval,
                SessionMessage::DiscoveryTick {
                    run,
                    attempt: attempt + 1,
                },
            );
        }
        actions
    }

    fn finish_run(&mut self, attempts: u32) {
        if let Some(run) = self.run.as_mut() {
            run.finished = true;
        }
        if self.roster.is_empty() {
            self.status = DiscoveryStatus::Exhausted { attempts };
            metrics::record_discovery_outcome("exhausted");
            info!(target: "sc.discovery", attempts, "Discovery exhausted, no peers found");
            self.notifier.notify(SessionNotification::NoPeersFound);
            self.notifier.status("No participants found");
        } else {
            self.converge(attempts);
        }
    }

    /// Delayed liveness ping of run `run`.
    pub(crate) fn on_ping(&self, run: u64) -> Option<DiscoveryAction> {
        self.current_run(run).map(|_| DiscoveryAction::Ping)
    }

    /// Delayed re-join of run `run`.
    pub(crate) fn on_rejoin(&self, run: u64) -> Option<DiscoveryAction> {
        self.current_run(run).map(|_| {
            info!(target: "sc.discovery", run, "Re-issuing join to recover announcements");
            DiscoveryAction::Rejoin
        })
    }

    fn converge(&mut self, attempts: u32) {
        self.cancel_run();
        self.status = DiscoveryStatus::Converged { attempts };
        metrics::record_discovery_outcome("converged");
        info!(
            target: "sc.discovery",
            attempts,
            peers = self.roster.len(),
            "Discovery converged"
        );
    }

    /// Merge announcements into the roster. Any announcement while a
    /// sequence is running (or has just exhausted) converges it.
    pub(crate) fn merge(&mut self, announcements: &[Announcement]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for announcement in announcements {
            let change = self.roster.merge(announcement);
            if change != MergeChange::Unchanged {
                outcome.changed = true;
                debug!(
                    target: "sc.discovery",
                    peer_id = %announcement.peer_id,
                    display_name = %announcement.display_name,
                    change = ?change,
                    "Roster updated"
                );
            }
            outcome.announced.push(announcement.peer_id);
        }

        if !announcements.is_empty() {
            match self.status {
                DiscoveryStatus::Running { attempt }
                | DiscoveryStatus::Exhausted { attempts: attempt } => {
                    self.converge(attempt);
                }
                DiscoveryStatus::Idle | DiscoveryStatus::Converged { .. } => {}
            }
        }
        outcome
    }

    /// Remove a peer that left or stopped publishing.
    pub(crate) fn remove(&mut self, peer_id: PeerId) -> Option<RemoteParticipant> {
        self.roster.remove(peer_id)
    }

    /// A probe attachment completed. Returns `false` if the probe is no
    /// longer wanted and the caller must detach it.
    pub(crate) fn probe_attached(&mut self, probe: u64, handle: Arc<dyn PluginHandle>) -> bool {
        let Some(entry) = self.probes.get_mut(&probe) else {
            return false;
        };
        entry.handle = Some(handle);
        self.mailbox.schedule(
            &self.scope,
            self.config.probe_linger,
            SessionMessage::ProbeExpired { probe },
        );
        true
    }

    pub(crate) fn probe_failed(&mut self, probe: u64) {
        if self.probes.remove(&probe).is_some() {
            metrics::record_discovery_probe("attach_failed");
        }
    }

    /// The probe produced its first reply; keep it a short while longer for
    /// any buffered events, then detach.
    pub(crate) fn probe_replied(&mut self, probe: u64) {
        let Some(entry) = self.probes.get_mut(&probe) else {
            return;
        };
        if entry.replied {
            return;
        }
        entry.replied = true;
        metrics::record_discovery_probe("replied");
        self.mailbox.schedule(
            &self.scope,
            self.config.probe_reply_grace,
            SessionMessage::ProbeExpired { probe },
        );
    }

    pub(crate) fn has_probe(&self, probe: u64) -> bool {
        self.probes.contains_key(&probe)
    }

    /// Drop a probe. The first of its two expiry timers wins.
    pub(crate) fn expire_probe(&mut self, probe: u64) -> Option<DiscoveryAction> {
        let entry = self.probes.remove(&probe)?;
        metrics::record_discovery_probe("expired");
        entry.handle.map(DiscoveryAction::DetachProbe)
    }

    fn cancel_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.scope.cancel();
        }
    }

    /// Cancel the sequence and hand back every probe attachment for release.
    pub(crate) fn stop(&mut self) -> Vec<Arc<dyn PluginHandle>> {
        self.cancel_run();
        self.probes
            .drain()
            .filter_map(|(_, probe)| probe.handle)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::videoroom::RoomEventBody;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        engine: DiscoveryEngine,
        mailbox: mpsc::Receiver<SessionMessage>,
        notifications: mpsc::Receiver<SessionNotification>,
        _sender: mpsc::Sender<SessionMessage>,
    }

    fn harness(config: DiscoveryConfig) -> Harness {
        let (sender, mailbox) = mpsc::channel(64);
        let (notify_tx, notifications) = mpsc::channel(64);
        let engine = DiscoveryEngine::new(
            config,
            Mailbox::new(&sender),
            Notifier::new(notify_tx),
            CancellationToken::new(),
        );
        Harness {
            engine,
            mailbox,
            notifications,
            _sender: sender,
        }
    }

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            max_attempts: 3,
            probe_after_attempt: Some(2),
            rejoin_attempt: Some(2),
            ..DiscoveryConfig::default()
        }
    }

    fn announce(id: u64, name: &str) -> Announcement {
        Announcement::new(PeerId(id), Some(name))
    }

    /// Drive the engine like the session does: execute ticks and collect
    /// every action until the mailbox stays quiet for `quiet`.
    async fn drain(h: &mut Harness, quiet: Duration) -> Vec<String> {
        let mut log = Vec::new();
        while let Ok(Some(message)) = tokio::time::timeout(quiet, h.mailbox.recv()).await {
            let actions = match message {
                SessionMessage::DiscoveryTick { run, attempt } => {
                    log.push(format!("tick {attempt}"));
                    h.engine.on_tick(run, attempt)
                }
                SessionMessage::DiscoveryPing { run } => {
                    h.engine.on_ping(run).into_iter().collect()
                }
                SessionMessage::DiscoveryRejoin { run } => {
                    h.engine.on_rejoin(run).into_iter().collect()
                }
                SessionMessage::ProbeExpired { probe } => {
                    h.engine.expire_probe(probe).into_iter().collect()
                }
                other => unreachable!("unexpected message {other:?}"),
            };
            for action in actions {
                log.push(format!("{action:?}"));
            }
        }
        log
    }

    #[test]
    fn test_normalization_excludes_self_and_non_publishers() {
        let event = RoomEvent::Participants {
            room: common::types::RoomId(42),
            participants: vec![
                ParticipantInfo {
                    id: PeerId(1),
                    display: Some("Me".to_string()),
                    publisher: true,
                },
                ParticipantInfo {
                    id: PeerId(2),
                    display: Some("Lurker".to_string()),
                    publisher: false,
                },
                ParticipantInfo {
                    id: PeerId(1_234_567_890),
                    display: None,
                    publisher: true,
                },
            ],
        };

        let found = announcements_in(&event, Some(PeerId(1)));
        assert_eq!(
            found,
            vec![Announcement {
                peer_id: PeerId(1_234_567_890),
                display_name: "Participant-123456".to_string(),
            }]
        );
    }

    #[test]
    fn test_event_publishers_and_participants_are_both_read() {
        let event = RoomEvent::Event(RoomEventBody {
            publishers: vec![PublisherInfo {
                id: PeerId(5),
                display: Some("Dr. Grey".to_string()),
            }],
            participants: Some(vec![ParticipantInfo {
                id: PeerId(6),
                display: Some(String::new()),
                publisher: true,
            }]),
            ..RoomEventBody::default()
        });

        let found = announcements_in(&event, None);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].display_name, "Participant-6");
    }

    #[test]
    fn test_roster_merge_is_union_by_peer_id() {
        let mut roster = Roster::default();
        assert_eq!(roster.merge(&announce(7, "Patient")), MergeChange::Added);
        assert_eq!(roster.merge(&announce(7, "Patient")), MergeChange::Unchanged);
        roster.set_active(PeerId(7), true);
        assert_eq!(roster.merge(&announce(7, "Jane Doe")), MergeChange::Renamed);

        assert_eq!(roster.len(), 1);
        let entry = roster.get(PeerId(7)).unwrap();
        assert_eq!(entry.display_name, "Jane Doe");
        // Updated in place, flags preserved.
        assert!(entry.active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_exactly_max_attempts() {
        let mut h = harness(DiscoveryConfig {
            probe_after_attempt: None,
            rejoin_attempt: None,
            ..fast_config()
        });
        assert!(h.engine.start(false));

        let log = drain(&mut h, Duration::from_secs(30)).await;
        assert_eq!(
            log,
            vec![
                "tick 1",
                "ListParticipants",
                "Ping",
                "tick 2",
                "ListParticipants",
                "Ping",
                "tick 3",
                "ListParticipants",
                "Ping",
            ]
        );
        assert_eq!(h.engine.status(), DiscoveryStatus::Exhausted { attempts: 3 });
        assert!(matches!(
            h.notifications.try_recv().unwrap(),
            SessionNotification::NoPeersFound
        ));

        // Nothing further is scheduled without an explicit restart.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(h.mailbox.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_and_probe_heuristics() {
        let mut h = harness(fast_config());
        h.engine.start(false);

        let log = drain(&mut h, Duration::from_secs(30)).await;
        assert!(log.contains(&"Rejoin".to_string()));
        let probes = log.iter().filter(|l| l.starts_with("OpenProbe")).count();
        // Attempts 2 and 3 each open a probe while the roster is empty.
        assert_eq!(probes, 2);
        assert!(log
            .iter()
            .any(|l| l.contains(&format!("feed: PeerId({})", 9_999_999_999_u64))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_announcement_converges_and_cancels_remaining_attempts() {
        let mut h = harness(fast_config());
        h.engine.start(false);

        let SessionMessage::DiscoveryTick { run, attempt } = h.mailbox.recv().await.unwrap() else {
            unreachable!("expected first tick");
        };
        let actions = h.engine.on_tick(run, attempt);
        assert_eq!(actions.len(), 1);

        let outcome = h.engine.merge(&[announce(7, "Patient")]);
        assert!(outcome.changed);
        assert_eq!(outcome.announced, vec![PeerId(7)]);
        assert_eq!(h.engine.status(), DiscoveryStatus::Converged { attempts: 1 });

        // The pending ping and next tick were cancelled with the run.
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert!(h.mailbox.try_recv().is_err());
        // A stale tick for the old run is ignored.
        assert!(h.engine.on_tick(run, 2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_empty_roster_converges_without_attempts() {
        let mut h = harness(fast_config());
        h.engine.merge(&[announce(7, "Patient")]);

        assert!(!h.engine.start(false));
        assert_eq!(h.engine.status(), DiscoveryStatus::Converged { attempts: 0 });

        // A forced refresh runs attempts anyway.
        assert!(h.engine.start(true));
        assert!(matches!(h.engine.status(), DiscoveryStatus::Running { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_lifecycle() {
        let mut h = harness(DiscoveryConfig {
            probe_after_attempt: Some(1),
            ..fast_config()
        });
        h.engine.start(false);
        let SessionMessage::DiscoveryTick { run, attempt } = h.mailbox.recv().await.unwrap() else {
            unreachable!("expected first tick");
        };
        let actions = h.engine.on_tick(run, attempt);
        let Some(DiscoveryAction::OpenProbe { probe, .. }) = actions.into_iter().nth(1) else {
            unreachable!("expected a probe");
        };
        assert!(h.engine.has_probe(probe));

        h.engine.probe_failed(probe);
        assert!(!h.engine.has_probe(probe));
        assert!(h.engine.expire_probe(probe).is_none());
        assert!(h.engine.stop().is_empty());
    }
}
