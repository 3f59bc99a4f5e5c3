//! Posting into the session mailbox from outside the actor.
//!
//! The actor never awaits gateway I/O itself. Timers, I/O tasks and
//! per-handle event forwarders are spawned with a [`Mailbox`] and post their
//! outcome back as a [`SessionMessage`]. The mailbox only holds a weak
//! sender: once every `SessionHandle` is dropped the channel closes even if
//! background tasks are still pending.
//!
//! Timers and forwarders are bound to a `CancellationToken` owned by the
//! scope that created them. I/O tasks are not cancelled; their completion is
//! always delivered so the actor can release whatever it produced.

use super::messages::SessionMessage;

use common::gateway::HandleEvent;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a membership, discovery run, probe or
/// subscription.
pub(crate) fn next_scope_id() -> u64 {
    NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Weak handle to a session's mailbox.
#[derive(Clone)]
pub(crate) struct Mailbox {
    sender: mpsc::WeakSender<SessionMessage>,
}

impl Mailbox {
    pub(crate) fn new(sender: &mpsc::Sender<SessionMessage>) -> Self {
        Self {
            sender: sender.downgrade(),
        }
    }

    /// Deliver a message. Returns `false` if the session is gone, in which
    /// case any resources the message carries are released.
    pub(crate) async fn post(&self, message: SessionMessage) -> bool {
        let Some(sender) = self.sender.upgrade() else {
            message.release_orphaned().await;
            return false;
        };
        match sender.send(message).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(message)) => {
                message.release_orphaned().await;
                false
            }
        }
    }

    /// Deliver `message` after `delay` unless `scope` is cancelled first.
    pub(crate) fn schedule(
        &self,
        scope: &CancellationToken,
        delay: Duration,
        message: SessionMessage,
    ) {
        let mailbox = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = scope.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    mailbox.post(message).await;
                }
            }
        });
    }

    /// Run a gateway or capture call in the background and post its outcome.
    pub(crate) fn spawn_io<F>(&self, task: F)
    where
        F: Future<Output = Option<SessionMessage>> + Send + 'static,
    {
        let mailbox = self.clone();
        tokio::spawn(async move {
            if let Some(message) = task.await {
                mailbox.post(message).await;
            }
        });
    }

    /// Forward a handle's event stream into the mailbox until `scope` is
    /// cancelled or the gateway closes the stream.
    pub(crate) fn forward_events<W>(
        &self,
        scope: &CancellationToken,
        mut events: mpsc::UnboundedReceiver<HandleEvent>,
        wrap: W,
    ) where
        W: Fn(HandleEvent) -> SessionMessage + Send + 'static,
    {
        let mailbox = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = scope.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if !mailbox.post(wrap(event)).await {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }
}
