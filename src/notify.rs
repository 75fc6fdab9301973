//! Cross-thread notification channel.
//!
//! Acquisition threads publish two kinds of signal over a `tokio::sync::broadcast`
//! channel: [`Notification::BatchReady`] after every tick and a one-shot
//! [`Notification::FatalAcquisitionError`] when a cycle cannot start.
//!
//! Consumers must treat delivery as level triggered. A slow subscriber may lag and
//! lose notifications; [`recv_change`] folds a lag into a plain "something changed"
//! so the consumer re-checks the store length instead of counting signals.

use crate::acquisition::LoopKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Signal published to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A tick completed.
    BatchReady {
        /// Loop that produced the tick
        kind: LoopKind,
        /// Rows in the store after the tick (zero for preview ticks)
        rows: usize,
    },
    /// The cycle could not start.
    FatalAcquisitionError(String),
}

/// Outcome of waiting on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A notification arrived.
    Signal(Notification),
    /// Notifications were dropped; re-check current state.
    Lagged(u64),
    /// Every sender is gone.
    Closed,
}

/// Publishing side, cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
    fatal_sent: Arc<AtomicBool>,
}

impl Notifier {
    /// Create a channel buffering up to `capacity` signals per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            fatal_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// New subscription, receiving signals sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Signal that a tick completed.
    pub fn batch_ready(&self, kind: LoopKind, rows: usize) {
        // No subscribers is fine
        if self.tx.send(Notification::BatchReady { kind, rows }).is_err() {
            debug!(?kind, "No subscribers for batch notification");
        }
    }

    /// Signal a fatal acquisition error. Only the first call per notifier is delivered.
    ///
    /// Returns whether this call sent the signal.
    pub fn fatal(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.fatal_sent.swap(true, Ordering::SeqCst) {
            debug!(%message, "Fatal error already signalled, suppressing");
            return false;
        }
        error!(%message, "Fatal acquisition error");
        if self
            .tx
            .send(Notification::FatalAcquisitionError(message))
            .is_err()
        {
            warn!("No subscribers for fatal notification, signal not delivered");
        }
        true
    }

    /// Whether a fatal error was signalled.
    pub fn fatal_sent(&self) -> bool {
        self.fatal_sent.load(Ordering::SeqCst)
    }
}

/// Wait for the next change on a subscription.
pub async fn recv_change(rx: &mut broadcast::Receiver<Notification>) -> Change {
    match rx.recv().await {
        Ok(notification) => Change::Signal(notification),
        Err(broadcast::error::RecvError::Lagged(skipped)) => Change::Lagged(skipped),
        Err(broadcast::error::RecvError::Closed) => Change::Closed,
    }
}

/// Non-blocking variant of [`recv_change`]; `None` when nothing is pending.
pub fn try_recv_change(rx: &mut broadcast::Receiver<Notification>) -> Option<Change> {
    match rx.try_recv() {
        Ok(notification) => Some(Change::Signal(notification)),
        Err(broadcast::error::TryRecvError::Lagged(skipped)) => Some(Change::Lagged(skipped)),
        Err(broadcast::error::TryRecvError::Closed) => Some(Change::Closed),
        Err(broadcast::error::TryRecvError::Empty) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn fatal_is_delivered_once() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        assert!(notifier.fatal("port busy"));
        assert!(!notifier.fatal("port busy again"));
        assert_eq!(
            try_recv_change(&mut rx),
            Some(Change::Signal(Notification::FatalAcquisitionError(
                "port busy".into()
            )))
        );
        assert_eq!(try_recv_change(&mut rx), None);
    }

    #[test]
    fn slow_subscriber_sees_lag() {
        let notifier = Notifier::new(2);
        let mut rx = notifier.subscribe();
        for rows in 1..=5 {
            notifier.batch_ready(LoopKind::Recording, rows);
        }
        assert!(matches!(try_recv_change(&mut rx), Some(Change::Lagged(3))));
        assert_eq!(
            try_recv_change(&mut rx),
            Some(Change::Signal(Notification::BatchReady {
                kind: LoopKind::Recording,
                rows: 4
            }))
        );
    }

    #[tokio::test]
    async fn async_receive() {
        let notifier = Notifier::new(4);
        let mut rx = notifier.subscribe();
        notifier.batch_ready(LoopKind::Preview, 0);
        assert_eq!(
            recv_change(&mut rx).await,
            Change::Signal(Notification::BatchReady {
                kind: LoopKind::Preview,
                rows: 0
            })
        );
        drop(notifier);
        assert_eq!(recv_change(&mut rx).await, Change::Closed);
    }

    #[test]
    fn sending_without_subscribers_is_harmless() {
        let notifier = Notifier::new(1);
        notifier.batch_ready(LoopKind::Recording, 1);
        assert!(!notifier.fatal_sent());
    }

    #[test]
    #[traced_test]
    fn fatal_without_subscribers_is_logged() {
        let notifier = Notifier::new(1);
        assert!(notifier.fatal("link lost"));
        assert!(notifier.fatal_sent());
        assert!(logs_contain("No subscribers for fatal notification"));
    }
}
