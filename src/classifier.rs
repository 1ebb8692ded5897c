//! Event classification and delivery deduplication.
//!
//! The classifier turns a verified [`Delivery`] into either a typed
//! [`DomainEvent`], a `Duplicate` marker, or an `Ignored` marker. The sender
//! may redeliver a webhook with the same delivery ID (e.g., after a timeout
//! or a 5xx response); deduplication is keyed by that ID in a bounded,
//! TTL-pruned window sized to cover the expected redelivery horizon.
//!
//! Malformed payloads are *not* recorded as seen: the delivery was never
//! processed, so a redelivery must still be able to go through. A persistence
//! failure downstream can likewise [`Classifier::forget`] the ID so the
//! sender's retry is not swallowed as a duplicate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::DeliveryId;
use crate::webhooks::{parse_webhook, DomainEvent, ParseError};

/// One inbound webhook delivery, immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// The unique delivery ID (idempotency key).
    pub id: DeliveryId,
    /// The event type header value (e.g., "pull_request").
    pub event_type: String,
    /// The raw JSON payload.
    pub payload: Vec<u8>,
    /// When the delivery was received.
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(id: DeliveryId, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Delivery {
            id,
            event_type: event_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// The outcome of classifying a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The delivery ID was seen before; no state mutation follows.
    Duplicate,
    /// The event type or action is not one the engine handles.
    Ignored,
    /// A typed domain event to apply to the store.
    Event(DomainEvent),
}

/// A bounded set of recently seen delivery IDs.
///
/// Entries expire after a TTL and the set is capped by capacity, evicting the
/// oldest entries first. Both bounds exist so the window covers the sender's
/// redelivery horizon without growing forever.
#[derive(Debug)]
struct DeliveryWindow {
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl DeliveryWindow {
    fn new(capacity: usize, ttl: Duration) -> Self {
        DeliveryWindow {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    /// Records the ID as seen. Returns `false` if it was already present.
    fn observe(&mut self, id: &DeliveryId, now: DateTime<Utc>) -> bool {
        self.prune(now);
        if self.seen.contains_key(id.as_str()) {
            return false;
        }
        self.seen.insert(id.as_str().to_string(), now);
        self.order.push_back(id.as_str().to_string());
        while self.seen.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn forget(&mut self, id: &DeliveryId) {
        self.seen.remove(id.as_str());
        // The order queue may retain a stale entry; it is skipped at eviction
        // time since the map lookup is authoritative.
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        while let Some(front) = self.order.front() {
            match self.seen.get(front) {
                Some(ts) if *ts <= cutoff => {
                    self.seen.remove(front.as_str());
                    self.order.pop_front();
                }
                // Stale order entry from forget(): drop it and keep pruning.
                None => {
                    self.order.pop_front();
                }
                Some(_) => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Classifies verified deliveries into domain events, deduplicating by
/// delivery ID.
#[derive(Debug)]
pub struct Classifier {
    window: Mutex<DeliveryWindow>,
}

impl Classifier {
    /// Creates a classifier with the given dedupe capacity and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Classifier {
            window: Mutex::new(DeliveryWindow::new(capacity, ttl)),
        }
    }

    /// Classifies a delivery.
    ///
    /// The payload is parsed first; a malformed payload returns `Err` without
    /// recording the delivery ID, so the sender's redelivery is not treated
    /// as a duplicate. Duplicate detection and marking are atomic: of two
    /// concurrent deliveries with the same ID, exactly one classifies as
    /// fresh.
    pub fn classify(&self, delivery: &Delivery) -> Result<Classification, ParseError> {
        let parsed = parse_webhook(&delivery.event_type, &delivery.payload)?;

        let fresh = self
            .window
            .lock()
            .expect("delivery window lock poisoned")
            .observe(&delivery.id, delivery.received_at);
        if !fresh {
            debug!(delivery_id = %delivery.id, "duplicate delivery ignored");
            return Ok(Classification::Duplicate);
        }

        match parsed {
            Some(event) => Ok(Classification::Event(event)),
            None => {
                debug!(
                    delivery_id = %delivery.id,
                    event_type = %delivery.event_type,
                    "unrecognized event ignored"
                );
                Ok(Classification::Ignored)
            }
        }
    }

    /// Removes a delivery ID from the seen window.
    ///
    /// Called when downstream processing fails after classification, so the
    /// sender's redelivery of the same ID is processed rather than dropped.
    pub fn forget(&self, id: &DeliveryId) {
        self.window
            .lock()
            .expect("delivery window lock poisoned")
            .forget(id);
    }

    /// Number of delivery IDs currently held in the window.
    pub fn window_len(&self) -> usize {
        self.window
            .lock()
            .expect("delivery window lock poisoned")
            .len()
    }
}
