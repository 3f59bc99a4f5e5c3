//! Bounded delivery of notifications to the presentation layer.
//!
//! Progress texts and roster refreshes are superseded by the next one, so a
//! full channel drops them. Every other notification drives what the
//! presentation layer binds or unbinds and is never dropped: when the
//! channel is full it waits in an overflow queue that a forwarding task
//! drains in order.

use super::messages::SessionNotification;
use crate::observability::metrics;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Sending side of the notification channel.
///
/// Never blocks the session. Must be created inside a Tokio runtime.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    sender: mpsc::Sender<SessionNotification>,
    overflow: mpsc::UnboundedSender<SessionNotification>,
    /// Notifications in the overflow queue not yet delivered.
    pending: Arc<AtomicUsize>,
}

impl Notifier {
    pub(crate) fn new(sender: mpsc::Sender<SessionNotification>) -> Self {
        let (overflow, queued) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(forward_overflow(
            sender.clone(),
            queued,
            Arc::clone(&pending),
        ));
        Self {
            sender,
            overflow,
            pending,
        }
    }

    pub(crate) fn notify(&self, notification: SessionNotification) {
        let backlog = self.pending.load(Ordering::SeqCst) > 0;
        if is_droppable(&notification) {
            if backlog {
                drop_notification(&notification);
                return;
            }
            match self.sender.try_send(notification) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => drop_notification(&dropped),
                Err(TrySendError::Closed(_)) => receiver_gone(),
            }
            return;
        }

        let notification = if backlog {
            notification
        } else {
            match self.sender.try_send(notification) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    receiver_gone();
                    return;
                }
                Err(TrySendError::Full(queued)) => queued,
            }
        };
        trace!(
            target: "sc.session",
            notification = ?notification,
            "Notification channel full, queueing notification"
        );
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.overflow.send(notification).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            receiver_gone();
        }
    }

    pub(crate) fn status(&self, text: impl Into<String>) {
        self.notify(SessionNotification::StatusChanged(text.into()));
    }
}

/// Only notifications that a later one supersedes may be lost.
fn is_droppable(notification: &SessionNotification) -> bool {
    matches!(
        notification,
        SessionNotification::StatusChanged(_) | SessionNotification::RosterChanged(_)
    )
}

fn drop_notification(notification: &SessionNotification) {
    warn!(
        target: "sc.session",
        notification = ?notification,
        "Notification channel full, dropping notification"
    );
    metrics::record_notification_dropped();
}

fn receiver_gone() {
    trace!(target: "sc.session", "Notification receiver dropped");
}

/// Deliver queued notifications in order, waiting for channel capacity.
async fn forward_overflow(
    sender: mpsc::Sender<SessionNotification>,
    mut queued: mpsc::UnboundedReceiver<SessionNotification>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(notification) = queued.recv().await {
        let delivered = sender.send(notification).await.is_ok();
        pending.fetch_sub(1, Ordering::SeqCst);
        if !delivered {
            receiver_gone();
            break;
        }
    }
}
