//! The delivery pipeline.
//!
//! [`Engine::handle_delivery`] runs one verified webhook delivery through
//! classification, the store, the eligibility evaluator, and queue
//! admission, appending audit records and publishing notifications along the
//! way.
//!
//! # Concurrency
//!
//! Deliveries for different PRs run fully in parallel. For one PR, the whole
//! pipeline section (store mutation, audit append, queue admission,
//! notification publish) runs inside a per-PR critical section, keyed by PR
//! number and created lazily. This is what guarantees both serialized
//! mutation and per-PR notification ordering. The lock for a PR is dropped
//! from the map once the PR closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditError, AuditLog, NewAuditRecord};
use crate::classifier::{Classification, Classifier, Delivery};
use crate::eligibility::{evaluate, Eligibility};
use crate::notify::Notifier;
use crate::queue::{AdmitOutcome, MergeQueue};
use crate::store::PullRequestStore;
use crate::types::{PrNumber, PullRequest};
use crate::webhooks::events::DomainEvent;
use crate::webhooks::ParseError;

/// Errors that can occur while processing a delivery.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The payload violated the expected schema. The delivery is rejected
    /// and not recorded as seen.
    #[error("malformed payload: {0}")]
    Malformed(#[from] ParseError),

    /// The audit record could not be durably written. The delivery is not
    /// acknowledged as processed; the sender is expected to redeliver, and
    /// the delivery ID has been released so the redelivery goes through.
    #[error("persistence failure: {0}")]
    Persistence(#[from] AuditError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The outcome reported for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A domain event was applied. Carries the event name and the verdict
    /// the new snapshot evaluated to.
    Processed {
        event: &'static str,
        pr: PrNumber,
        eligibility: Eligibility,
    },
    /// The delivery ID was seen before; nothing changed.
    Duplicate,
    /// The event type or action is not one the engine handles.
    Ignored,
}

/// Lazily created per-PR critical sections.
///
/// The map itself is guarded by a plain mutex held only long enough to fetch
/// or insert the entry; the per-PR tokio mutex is then held across the whole
/// pipeline section, including awaits.
#[derive(Debug, Default)]
struct PrLocks {
    map: Mutex<HashMap<PrNumber, Arc<tokio::sync::Mutex<()>>>>,
}

impl PrLocks {
    async fn lock(&self, pr: PrNumber) -> tokio::sync::OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.map.lock().expect("pr lock map poisoned");
            Arc::clone(map.entry(pr).or_default())
        };
        entry.lock_owned().await
    }

    fn remove(&self, pr: PrNumber) {
        self.map.lock().expect("pr lock map poisoned").remove(&pr);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().expect("pr lock map poisoned").len()
    }
}

/// Ties the pipeline stages together.
pub struct Engine {
    classifier: Classifier,
    store: Arc<PullRequestStore>,
    queue: Arc<MergeQueue>,
    audit: Arc<AuditLog>,
    notifier: Notifier,
    auto_merge_label: String,
    locks: PrLocks,
}

impl Engine {
    pub fn new(
        classifier: Classifier,
        store: Arc<PullRequestStore>,
        queue: Arc<MergeQueue>,
        audit: Arc<AuditLog>,
        notifier: Notifier,
        auto_merge_label: impl Into<String>,
    ) -> Self {
        Engine {
            classifier,
            store,
            queue,
            audit,
            notifier,
            auto_merge_label: auto_merge_label.into(),
            locks: PrLocks::default(),
        }
    }

    /// Processes one verified delivery end to end.
    ///
    /// Duplicates and unrecognized events are accepted with a marker audit
    /// record and no state mutation. On a persistence failure the delivery
    /// ID is released again so the sender's redelivery is not swallowed as
    /// a duplicate.
    #[instrument(skip(self, delivery), fields(delivery_id = %delivery.id, event_type = %delivery.event_type))]
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<DeliveryOutcome> {
        let event = match self.classifier.classify(&delivery)? {
            Classification::Duplicate => {
                self.audit.append(
                    NewAuditRecord::event("duplicate_ignored").delivery(delivery.id.clone()),
                )?;
                return Ok(DeliveryOutcome::Duplicate);
            }
            Classification::Ignored => {
                if let Err(e) = self.mark_ignored(&delivery) {
                    self.classifier.forget(&delivery.id);
                    return Err(e);
                }
                return Ok(DeliveryOutcome::Ignored);
            }
            Classification::Event(event) => event,
        };

        match self.apply_event(&delivery, &event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Not acknowledged as processed: release the ID so the
                // sender's redelivery is handled rather than deduplicated.
                self.classifier.forget(&delivery.id);
                Err(e)
            }
        }
    }

    fn mark_ignored(&self, delivery: &Delivery) -> Result<()> {
        self.audit.append(
            NewAuditRecord::event("event_ignored")
                .delivery(delivery.id.clone())
                .detail(format!("event type {:?}", delivery.event_type)),
        )?;
        Ok(())
    }

    /// Applies a classified event inside the PR's critical section.
    async fn apply_event(&self, delivery: &Delivery, event: &DomainEvent) -> Result<DeliveryOutcome> {
        let pr = event.pr_number();
        let _guard = self.locks.lock(pr).await;

        // Supersession comes first: a moved head invalidates any queued
        // entry before the new snapshot is even computed.
        if matches!(event, DomainEvent::PullRequestUpdated(_)) {
            self.cancel_active(pr, "superseded by new head commit")?;
        }
        // A closed PR has no business merging either.
        if matches!(event, DomainEvent::PullRequestClosed(_)) {
            self.cancel_active(pr, "pull request closed")?;
        }

        let before = self.store.get(pr).map(|p| p.summary());
        let snapshot = self.store.apply(event);
        let eligibility = evaluate(&snapshot, &self.auto_merge_label);

        self.audit.append(
            NewAuditRecord::event(event.name())
                .delivery(delivery.id.clone())
                .pr(pr)
                .before(before)
                .after(snapshot.summary())
                .detail(match eligibility {
                    Eligibility::Eligible => "eligible".to_string(),
                    Eligibility::Ineligible(reason) => format!("ineligible: {}", reason),
                }),
        )?;
        self.notifier.publish(
            event.name(),
            Some(pr),
            serde_json::to_value(&snapshot).unwrap_or_default(),
        );

        if eligibility.is_eligible() {
            self.admit(&snapshot, delivery)?;
        } else {
            debug!(pr = %pr, eligibility = ?eligibility, "not admitting");
        }

        if snapshot.state.is_closed() {
            self.locks.remove(pr);
        }

        Ok(DeliveryOutcome::Processed {
            event: event.name(),
            pr,
            eligibility,
        })
    }

    /// Manually removes a PR's queued entry (operator action).
    ///
    /// Returns `true` if an entry was cancelled. A `merging` entry cannot be
    /// removed; the in-flight merge completes and is reconciled afterwards.
    pub async fn remove_from_queue(&self, pr: PrNumber) -> Result<bool> {
        let _guard = self.locks.lock(pr).await;
        self.cancel_active(pr, "manually removed from queue")
    }

    /// Cancels the PR's queued entry, if any, with an audit trail.
    fn cancel_active(&self, pr: PrNumber, reason: &str) -> Result<bool> {
        let Some(cancelled) = self.queue.cancel(pr, reason, Utc::now()) else {
            return Ok(false);
        };
        warn!(pr = %pr, reason = %reason, "queued entry cancelled");
        self.audit.append(
            NewAuditRecord::event("queue_cancelled")
                .pr(pr)
                .detail(reason.to_string()),
        )?;
        self.notifier.publish(
            "queue_cancelled",
            Some(pr),
            serde_json::to_value(&cancelled).unwrap_or_default(),
        );
        Ok(true)
    }

    fn admit(&self, snapshot: &PullRequest, delivery: &Delivery) -> Result<()> {
        let outcome = self.queue.admit(
            snapshot.number,
            snapshot.head_sha.clone(),
            snapshot.author_is_bot(),
            Utc::now(),
        );
        match outcome {
            AdmitOutcome::Admitted(entry) => {
                info!(pr = %snapshot.number, "admitted to merge queue");
                self.audit.append(
                    NewAuditRecord::event("queue_admitted")
                        .delivery(delivery.id.clone())
                        .pr(snapshot.number)
                        .detail(format!("head {}", entry.head_sha.short())),
                )?;
                self.notifier.publish(
                    "queue_admitted",
                    Some(snapshot.number),
                    serde_json::to_value(&entry).unwrap_or_default(),
                );
            }
            AdmitOutcome::AlreadyActive => {
                debug!(pr = %snapshot.number, "already queued");
            }
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<PullRequestStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<MergeQueue> {
        &self.queue
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::executor::{MergeExecutor, NullMergeExecutor};
    use crate::queue::worker::QueueWorker;
    use crate::queue::{QueueEntryStatus, SoakPolicy};
    use crate::types::DeliveryId;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const LABEL: &str = "auto-merge";

    struct Fixture {
        engine: Arc<Engine>,
        executor: Arc<NullMergeExecutor>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(soak: SoakPolicy) -> Self {
            let store = Arc::new(PullRequestStore::new());
            let queue = Arc::new(MergeQueue::new(soak));
            let audit = Arc::new(AuditLog::in_memory());
            let notifier = Notifier::new(256);
            let classifier = Classifier::new(1024, ChronoDuration::hours(24));
            let engine = Arc::new(Engine::new(
                classifier,
                store,
                queue,
                audit,
                notifier,
                LABEL,
            ));
            Fixture {
                engine,
                executor: Arc::new(NullMergeExecutor::new()),
                cancel: CancellationToken::new(),
            }
        }

        fn spawn_worker(&self) -> tokio::task::JoinHandle<()> {
            let worker = QueueWorker::new(
                Arc::clone(self.engine.queue()),
                Arc::clone(self.engine.store()),
                Arc::clone(&self.executor) as Arc<dyn MergeExecutor>,
                Arc::clone(self.engine.audit()),
                self.engine.notifier().clone(),
                LABEL,
                self.cancel.clone(),
            );
            tokio::spawn(worker.run())
        }

        async fn deliver(&self, id: &str, event_type: &str, payload: serde_json::Value) -> DeliveryOutcome {
            let delivery = Delivery::new(
                DeliveryId::new(id),
                event_type,
                serde_json::to_vec(&payload).unwrap(),
            );
            self.engine.handle_delivery(delivery).await.unwrap()
        }

        async fn open_pr(&self, id: &str, number: u64, author: &str, labels: &[&str]) {
            self.deliver(
                id,
                "pull_request",
                json!({
                    "action": "opened",
                    "pull_request": {
                        "number": number,
                        "title": "change",
                        "user": { "login": author },
                        "head": { "ref": "feature", "sha": "a".repeat(40) },
                        "base": { "ref": "main" },
                        "labels": labels.iter().map(|l| json!({ "name": l })).collect::<Vec<_>>(),
                        "mergeable": true,
                        "merged": false
                    }
                }),
            )
            .await;
        }

        async fn approve(&self, id: &str, number: u64) {
            self.deliver(
                id,
                "pull_request_review",
                json!({
                    "action": "submitted",
                    "review": { "state": "approved", "user": { "login": "reviewer" } },
                    "pull_request": { "number": number }
                }),
            )
            .await;
        }

        async fn check(&self, id: &str, number: u64, name: &str, conclusion: &str) -> DeliveryOutcome {
            self.deliver(
                id,
                "check_run",
                json!({
                    "action": "completed",
                    "check_run": {
                        "name": name,
                        "conclusion": conclusion,
                        "pull_requests": [ { "number": number } ]
                    }
                }),
            )
            .await
        }

        async fn push_new_head(&self, id: &str, number: u64, sha_char: char, labels: &[&str]) {
            self.deliver(
                id,
                "pull_request",
                json!({
                    "action": "synchronize",
                    "pull_request": {
                        "number": number,
                        "head": { "ref": "feature", "sha": sha_char.to_string().repeat(40) },
                        "base": { "ref": "main" },
                        "labels": labels.iter().map(|l| json!({ "name": l })).collect::<Vec<_>>(),
                        "merged": false
                    }
                }),
            )
            .await;
        }

        /// Polls (in virtual time) until the PR's entry reaches a terminal
        /// state and returns it from history.
        async fn wait_terminal(&self, pr: PrNumber) -> crate::queue::QueueEntry {
            for _ in 0..2000 {
                if self.engine.queue().active_entry(pr).is_none() {
                    if let Some(entry) = self
                        .engine
                        .queue()
                        .recent_history(usize::MAX)
                        .into_iter()
                        .rev()
                        .find(|e| e.pr == pr)
                    {
                        return entry;
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            panic!("entry for {pr} never reached a terminal state");
        }
    }

    fn instant_soak() -> SoakPolicy {
        SoakPolicy {
            human: Duration::from_millis(0),
            bot: Duration::from_millis(0),
        }
    }

    /// Full happy path: opened, approved, three green checks, labeled.
    /// Evaluation admits, the soak elapses, and the executor runs once.
    #[tokio::test(start_paused = true)]
    async fn scenario_green_pr_merges_once() {
        let f = Fixture::new(SoakPolicy {
            human: Duration::from_secs(60),
            bot: Duration::from_secs(600),
        });
        let handle = f.spawn_worker();

        f.open_pr("d1", 100, "octocat", &[LABEL]).await;
        f.approve("d2", 100).await;
        f.check("d3", 100, "build", "success").await;
        f.check("d4", 100, "lint", "success").await;
        let outcome = f.check("d5", 100, "test", "success").await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Processed {
                event: "check_completed",
                pr: PrNumber(100),
                eligibility: Eligibility::Eligible,
            }
        );
        assert!(f.engine.queue().active_entry(PrNumber(100)).is_some());

        let entry = f.wait_terminal(PrNumber(100)).await;
        assert_eq!(entry.status, QueueEntryStatus::Completed);
        assert_eq!(f.executor.call_count(), 1);

        f.cancel.cancel();
        handle.await.unwrap();
    }

    /// A failing check keeps the PR out of the queue entirely.
    #[tokio::test(start_paused = true)]
    async fn scenario_failing_check_blocks_admission() {
        let f = Fixture::new(instant_soak());
        let handle = f.spawn_worker();

        f.open_pr("d1", 101, "octocat", &[LABEL]).await;
        f.approve("d2", 101).await;
        let outcome = f.check("d3", 101, "build", "failure").await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Processed {
                event: "check_completed",
                pr: PrNumber(101),
                eligibility: Eligibility::Ineligible(
                    crate::eligibility::IneligibleReason::ChecksNotSuccessful
                ),
            }
        );
        assert!(f.engine.queue().active_entry(PrNumber(101)).is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.executor.call_count(), 0);

        f.cancel.cancel();
        handle.await.unwrap();
    }

    /// A new head while queued cancels the entry and clears the stale
    /// approval and check state; no merge happens until re-approval.
    #[tokio::test(start_paused = true)]
    async fn scenario_new_head_supersedes_queued_entry() {
        let f = Fixture::new(SoakPolicy {
            human: Duration::from_secs(300),
            bot: Duration::from_secs(600),
        });
        let handle = f.spawn_worker();

        f.open_pr("d1", 102, "octocat", &[LABEL]).await;
        f.approve("d2", 102).await;
        f.check("d3", 102, "build", "success").await;
        assert!(f.engine.queue().active_entry(PrNumber(102)).is_some());

        // New commit before the soak elapses.
        f.push_new_head("d4", 102, 'b', &[LABEL]).await;

        // The original entry is cancelled, not left queued or merging.
        assert!(f.engine.queue().active_entry(PrNumber(102)).is_none());
        let history = f.engine.queue().recent_history(usize::MAX);
        let cancelled = history.iter().rev().find(|e| e.pr == PrNumber(102)).unwrap();
        assert_eq!(cancelled.status, QueueEntryStatus::Cancelled);

        // Stale signals are cleared pending re-evaluation.
        let snapshot = f.engine.store().get(PrNumber(102)).unwrap();
        assert!(snapshot.approval.is_none());
        assert!(snapshot.checks.is_empty());

        // Even long after the original soak, nothing merges.
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(f.executor.call_count(), 0);

        // Re-approval and green checks re-admit at the new head.
        f.approve("d5", 102).await;
        f.check("d6", 102, "build", "success").await;
        let entry = f.wait_terminal(PrNumber(102)).await;
        assert_eq!(entry.status, QueueEntryStatus::Completed);
        assert_eq!(f.executor.call_count(), 1);
        assert_eq!(f.executor.calls()[0].1.as_str(), "b".repeat(40));

        f.cancel.cancel();
        handle.await.unwrap();
    }

    /// Replaying a delivery ID leaves exactly one state mutation and one
    /// non-duplicate audit record.
    #[tokio::test]
    async fn replayed_delivery_is_idempotent() {
        let f = Fixture::new(instant_soak());

        f.open_pr("d1", 1, "octocat", &[]).await;
        let outcome = f
            .deliver(
                "d1",
                "pull_request",
                json!({
                    "action": "opened",
                    "pull_request": {
                        "number": 1,
                        "title": "change",
                        "user": { "login": "octocat" },
                        "head": { "ref": "feature", "sha": "a".repeat(40) },
                        "base": { "ref": "main" },
                        "labels": [],
                        "merged": false
                    }
                }),
            )
            .await;
        assert_eq!(outcome, DeliveryOutcome::Duplicate);

        let records = f.engine.audit().recent(100);
        let opened: Vec<_> = records
            .iter()
            .filter(|r| r.event == "pull_request_opened")
            .collect();
        let duplicates: Vec<_> = records
            .iter()
            .filter(|r| r.event == "duplicate_ignored")
            .collect();
        assert_eq!(opened.len(), 1);
        assert_eq!(duplicates.len(), 1);
    }

    /// An unrecognized event type is accepted, audited, and mutates nothing.
    #[tokio::test]
    async fn unrecognized_event_is_accepted_and_marked() {
        let f = Fixture::new(instant_soak());

        let outcome = f.deliver("d1", "deployment_status", json!({})).await;
        assert_eq!(outcome, DeliveryOutcome::Ignored);
        assert!(f.engine.store().is_empty());

        let records = f.engine.audit().recent(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "event_ignored");
    }

    /// Concurrent deliveries for the same PR serialize: both signals land.
    #[tokio::test]
    async fn concurrent_deliveries_for_one_pr_serialize() {
        let f = Fixture::new(instant_soak());
        f.open_pr("d1", 5, "octocat", &[]).await;

        let e1 = Arc::clone(&f.engine);
        let review = tokio::spawn(async move {
            let delivery = Delivery::new(
                DeliveryId::new("d2"),
                "pull_request_review",
                serde_json::to_vec(&json!({
                    "action": "submitted",
                    "review": { "state": "approved", "user": { "login": "reviewer" } },
                    "pull_request": { "number": 5 }
                }))
                .unwrap(),
            );
            e1.handle_delivery(delivery).await.unwrap()
        });
        let e2 = Arc::clone(&f.engine);
        let check = tokio::spawn(async move {
            let delivery = Delivery::new(
                DeliveryId::new("d3"),
                "check_run",
                serde_json::to_vec(&json!({
                    "action": "completed",
                    "check_run": {
                        "name": "build",
                        "conclusion": "success",
                        "pull_requests": [ { "number": 5 } ]
                    }
                }))
                .unwrap(),
            );
            e2.handle_delivery(delivery).await.unwrap()
        });
        review.await.unwrap();
        check.await.unwrap();

        let snapshot = f.engine.store().get(PrNumber(5)).unwrap();
        assert!(snapshot.approval.is_some());
        assert_eq!(
            snapshot.checks.get("build"),
            Some(&crate::types::CheckState::Success)
        );
    }

    /// The merging-slot invariant holds while several PRs flow through.
    #[tokio::test(start_paused = true)]
    async fn at_most_one_merging_at_any_instant() {
        let f = Fixture::new(instant_soak());
        let handle = f.spawn_worker();

        for n in 1..=4u64 {
            let base = (n - 1) * 10;
            f.open_pr(&format!("open-{n}"), n, "octocat", &[LABEL]).await;
            f.approve(&format!("approve-{base}"), n).await;
            f.check(&format!("check-{base}"), n, "build", "success").await;
            assert!(f.engine.queue().merging_count() <= 1);
        }

        for n in 1..=4u64 {
            f.wait_terminal(PrNumber(n)).await;
            assert!(f.engine.queue().merging_count() <= 1);
        }
        assert_eq!(f.executor.call_count(), 4);

        f.cancel.cancel();
        handle.await.unwrap();
    }

    /// Closing a PR cancels its queued entry and releases its lock entry.
    #[tokio::test(start_paused = true)]
    async fn close_cancels_queue_entry_and_frees_lock() {
        let f = Fixture::new(SoakPolicy {
            human: Duration::from_secs(300),
            bot: Duration::from_secs(600),
        });

        f.open_pr("d1", 9, "octocat", &[LABEL]).await;
        f.approve("d2", 9).await;
        f.check("d3", 9, "build", "success").await;
        assert!(f.engine.queue().active_entry(PrNumber(9)).is_some());
        assert_eq!(f.engine.locks.len(), 1);

        f.deliver(
            "d4",
            "pull_request",
            json!({
                "action": "closed",
                "pull_request": {
                    "number": 9,
                    "head": { "ref": "feature", "sha": "a".repeat(40) },
                    "base": { "ref": "main" },
                    "merged": false
                }
            }),
        )
        .await;

        assert!(f.engine.queue().active_entry(PrNumber(9)).is_none());
        assert_eq!(f.engine.locks.len(), 0);
    }

    /// Malformed payloads are rejected without consuming the delivery ID.
    #[tokio::test]
    async fn malformed_payload_is_rejected_and_replayable() {
        let f = Fixture::new(instant_soak());

        let bad = Delivery::new(DeliveryId::new("d1"), "pull_request", b"{broken".to_vec());
        let err = f.engine.handle_delivery(bad).await.unwrap_err();
        assert!(matches!(err, EngineError::Malformed(_)));
        assert!(f.engine.audit().is_empty());

        // The same ID with a valid payload processes normally.
        f.open_pr("d1", 3, "octocat", &[]).await;
        assert!(f.engine.store().get(PrNumber(3)).is_some());
    }
}
