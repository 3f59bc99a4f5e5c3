//! Subscription Manager: at most one subscriber handle per remote peer.
//!
//! The manager owns the bookkeeping of every subscription (gateway handle,
//! negotiation state, receiver polling). The session drives the gateway
//! calls and routes their completions here, tagged with the subscription id
//! that issued them. A completion for an id that is no longer current is
//! stale and must not touch the replacement.
//!
//! Each subscription has its own cancellation scope (a child of the
//! membership scope). Its event forwarder and polling timers are bound to
//! it, so tearing a subscription down stops both before the next tick.

use super::mailbox::{next_scope_id, Mailbox};
use super::messages::{NegotiationState, SessionMessage};
use crate::config::TrackPollConfig;
use crate::observability::metrics;

use common::gateway::PluginHandle;
use common::types::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Receiver polling progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    Idle,
    Running,
    /// Ran out of checks with no tracks.
    Exhausted,
}

/// One subscription to one remote peer.
pub(crate) struct SubscriptionHandle {
    pub(crate) peer_id: PeerId,
    pub(crate) id: u64,
    pub(crate) gateway: Option<Arc<dyn PluginHandle>>,
    pub(crate) negotiation: NegotiationState,
    pub(crate) poll: PollState,
    pub(crate) scope: CancellationToken,
}

/// Result of a receiver poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollStep {
    /// Tracks present, polling stopped.
    Done,
    /// Next check scheduled.
    Continue,
    /// Last check elapsed with no tracks.
    Exhausted,
}

pub(crate) struct SubscriptionManager {
    handles: HashMap<PeerId, SubscriptionHandle>,
    poll_config: TrackPollConfig,
    mailbox: Mailbox,
    scope: CancellationToken,
}

impl SubscriptionManager {
    pub(crate) fn new(
        poll_config: TrackPollConfig,
        mailbox: Mailbox,
        scope: CancellationToken,
    ) -> Self {
        Self {
            handles: HashMap::new(),
            poll_config,
            mailbox,
            scope,
        }
    }

    pub(crate) fn contains(&self, peer_id: PeerId) -> bool {
        self.handles.contains_key(&peer_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn get(&self, peer_id: PeerId) -> Option<&SubscriptionHandle> {
        self.handles.get(&peer_id)
    }

    /// The subscription for `peer_id` if it is still the one identified by
    /// `subscription`.
    pub(crate) fn current_mut(
        &mut self,
        peer_id: PeerId,
        subscription: u64,
    ) -> Option<&mut SubscriptionHandle> {
        self.handles
            .get_mut(&peer_id)
            .filter(|handle| handle.id == subscription)
    }

    pub(crate) fn is_current(&self, peer_id: PeerId, subscription: u64) -> bool {
        self.handles
            .get(&peer_id)
            .is_some_and(|handle| handle.id == subscription)
    }

    /// Register a new subscription in `Attaching`. The caller must have
    /// removed any previous subscription for the peer.
    pub(crate) fn open(&mut self, peer_id: PeerId) -> (u64, CancellationToken) {
        debug_assert!(!self.handles.contains_key(&peer_id));
        let handle = SubscriptionHandle {
            peer_id,
            id: next_scope_id(),
            gateway: None,
            negotiation: NegotiationState::Attaching,
            poll: PollState::Idle,
            scope: self.scope.child_token(),
        };
        let opened = (handle.id, handle.scope.clone());
        self.handles.insert(peer_id, handle);
        self.report_active();
        debug!(
            target: "sc.subscription",
            peer_id = %peer_id,
            subscription = opened.0,
            "Subscription opened"
        );
        opened
    }

    /// Remove a subscription and cancel its timers and event forwarding.
    /// The caller releases the returned gateway handle.
    pub(crate) fn remove(&mut self, peer_id: PeerId) -> Option<SubscriptionHandle> {
        let handle = self.handles.remove(&peer_id)?;
        handle.scope.cancel();
        self.report_active();
        debug!(
            target: "sc.subscription",
            peer_id = %peer_id,
            subscription = handle.id,
            negotiation = handle.negotiation.as_str(),
            "Subscription removed"
        );
        Some(handle)
    }

    /// Remove every subscription.
    pub(crate) fn drain(&mut self) -> Vec<SubscriptionHandle> {
        let peers: Vec<PeerId> = self.handles.keys().copied().collect();
        peers
            .into_iter()
            .filter_map(|peer_id| self.remove(peer_id))
            .collect()
    }

    /// Begin receiver polling unless a poll chain is already running.
    pub(crate) fn start_polling(&mut self, peer_id: PeerId) -> bool {
        let delay = self.poll_config.initial_delay;
        let Some(handle) = self.handles.get_mut(&peer_id) else {
            return false;
        };
        if handle.poll == PollState::Running {
            return false;
        }
        handle.poll = PollState::Running;
        self.mailbox.schedule(
            &handle.scope,
            delay,
            SessionMessage::TrackPoll {
                peer_id,
                subscription: handle.id,
                check: 1,
            },
        );
        true
    }

    /// Account for poll tick `check`, given whether the peer has any track.
    pub(crate) fn poll_step(
        &mut self,
        peer_id: PeerId,
        subscription: u64,
        check: u32,
        has_tracks: bool,
    ) -> PollStep {
        let max_checks = self.poll_config.max_checks;
        let interval = self.poll_config.interval;
        let Some(handle) = self.current_mut(peer_id, subscription) else {
            return PollStep::Done;
        };
        if has_tracks {
            handle.poll = PollState::Idle;
            return PollStep::Done;
        }
        if check >= max_checks {
            handle.poll = PollState::Exhausted;
            return PollStep::Exhausted;
        }
        let scope = handle.scope.clone();
        self.mailbox.schedule(
            &scope,
            interval,
            SessionMessage::TrackPoll {
                peer_id,
                subscription,
                check: check + 1,
            },
        );
        PollStep::Continue
    }

    /// Record a subscription failure against `stage` and remove it.
    pub(crate) fn fail(
        &mut self,
        peer_id: PeerId,
        subscription: u64,
        stage: &'static str,
    ) -> Option<SubscriptionHandle> {
        if !self.is_current(peer_id, subscription) {
            return None;
        }
        metrics::record_subscription_failure(stage);
        self.remove(peer_id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SubscriptionHandle> {
        self.handles.values()
    }

    fn report_active(&self) {
        metrics::set_subscriptions_active(self.handles.len() as u64);
    }
}
