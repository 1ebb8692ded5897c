//! Notification fan-out to subscribers.
//!
//! A thin wrapper over a `tokio::sync::broadcast` channel. Delivery is
//! best-effort: a subscriber that falls behind or disconnects misses messages
//! until it resubscribes, and is expected to reconcile by fetching a fresh
//! snapshot from the query API rather than relying on the stream alone.
//!
//! Messages for a given PR are published in mutation order (the engine
//! publishes from inside the per-PR critical section, and the queue worker is
//! a single task), and the broadcast channel preserves send order, so per-PR
//! ordering holds for every subscriber. No ordering is guaranteed across
//! different PRs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::PrNumber;

/// A state-change message published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The event name (same vocabulary as audit records).
    pub event: String,
    /// The affected PR, when the message concerns one.
    pub pr_number: Option<PrNumber>,
    /// Event-specific payload (PR snapshot, queue entry, error detail, ...).
    pub payload: serde_json::Value,
    /// When the notification was published.
    pub ts: DateTime<Utc>,
}

/// Handle for publishing and subscribing to notifications.
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    /// Creates a notifier whose channel buffers `capacity` messages per
    /// subscriber before the slowest subscriber starts losing the oldest.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Notifier { tx }
    }

    /// Publishes a message to all current subscribers. Best-effort: having
    /// no subscribers is not an error.
    pub fn publish(
        &self,
        event: impl Into<String>,
        pr_number: Option<PrNumber>,
        payload: serde_json::Value,
    ) {
        let notification = Notification {
            event: event.into(),
            pr_number,
            payload,
            ts: Utc::now(),
        };
        trace!(event = %notification.event, "publishing notification");
        // send() only fails when there are no receivers; that is fine.
        let _ = self.tx.send(notification);
    }

    /// Subscribes to all notifications from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_messages() {
        let notifier = Notifier::new(16);
        let mut rx = notifier.subscribe();

        notifier.publish("queue_admitted", Some(PrNumber(1)), json!({"pr": 1}));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "queue_admitted");
        assert_eq!(msg.pr_number, Some(PrNumber(1)));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let notifier = Notifier::new(16);
        notifier.publish("merge_completed", Some(PrNumber(1)), json!({}));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn per_pr_order_is_preserved() {
        let notifier = Notifier::new(64);
        let mut rx = notifier.subscribe();

        for event in ["pull_request_opened", "review_submitted", "queue_admitted"] {
            notifier.publish(event, Some(PrNumber(7)), json!({}));
        }

        assert_eq!(rx.recv().await.unwrap().event, "pull_request_opened");
        assert_eq!(rx.recv().await.unwrap().event, "review_submitted");
        assert_eq!(rx.recv().await.unwrap().event, "queue_admitted");
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let notifier = Notifier::new(16);
        notifier.publish("pull_request_opened", Some(PrNumber(1)), json!({}));

        let mut rx = notifier.subscribe();
        notifier.publish("queue_admitted", Some(PrNumber(1)), json!({}));

        // Only the message published after subscribing arrives.
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "queue_admitted");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_lag_then_newest() {
        let notifier = Notifier::new(2);
        let mut rx = notifier.subscribe();

        for i in 0..5 {
            notifier.publish(format!("e{i}"), None, json!({}));
        }

        // The slow subscriber lost the oldest messages.
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));

        // It can keep reading the newest and reconcile via snapshot fetch.
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "e3");
    }
}
