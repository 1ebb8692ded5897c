//! The queue worker: the single task that owns the merging slot.
//!
//! All merge executions flow through this one loop, which is what makes the
//! at-most-one-merging invariant hold: nothing else ever transitions an
//! entry to `merging`. The loop:
//!
//! 1. Selects the oldest queued entry (FIFO by `entered_at`)
//! 2. Sleeps out the remainder of its soak time, waking early if the queue
//!    changes (a cancellation or admission re-runs selection)
//! 3. Re-checks eligibility against the current PR snapshot; a stale or
//!    no-longer-eligible entry is cancelled, not merged
//! 4. Takes the merging slot, calls the merge executor exactly once, and
//!    records the terminal outcome
//!
//! Merge failures are terminal for the entry and never retried here; a
//! fresh eligible admission is required once the underlying issue is
//! resolved.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, NewAuditRecord};
use crate::eligibility::{evaluate, Eligibility};
use crate::executor::MergeExecutor;
use crate::notify::Notifier;
use crate::store::PullRequestStore;
use crate::types::PrNumber;

use super::{MergeQueue, Next, QueueEntry};

/// Drives the merge queue. Run exactly one per process.
pub struct QueueWorker {
    queue: Arc<MergeQueue>,
    store: Arc<PullRequestStore>,
    executor: Arc<dyn MergeExecutor>,
    audit: Arc<AuditLog>,
    notifier: Notifier,
    auto_merge_label: String,
    cancel: CancellationToken,
}

impl QueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<MergeQueue>,
        store: Arc<PullRequestStore>,
        executor: Arc<dyn MergeExecutor>,
        audit: Arc<AuditLog>,
        notifier: Notifier,
        auto_merge_label: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        QueueWorker {
            queue,
            store,
            executor,
            audit,
            notifier,
            auto_merge_label: auto_merge_label.into(),
            cancel,
        }
    }

    /// Runs until the cancellation token fires.
    ///
    /// An in-flight merge is always allowed to finish; cancellation is only
    /// observed between entries.
    pub async fn run(self) {
        info!("queue worker started");
        loop {
            match self.queue.next() {
                Next::Idle => {
                    tokio::select! {
                        _ = self.queue.changed() => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Next::Wait(deadline) => {
                    tokio::select! {
                        // A queue change may have cancelled or outranked the
                        // entry we were soaking; re-run selection.
                        _ = self.queue.changed() => {}
                        _ = sleep_until(deadline) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Next::Ready(entry) => {
                    self.process(entry).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }
        info!("queue worker stopped");
    }

    /// Merges one soaked entry, or cancels it if it no longer qualifies.
    async fn process(&self, entry: QueueEntry) {
        let pr = entry.pr;

        if let Some(reason) = self.recheck_failure(&entry) {
            if let Some(cancelled) = self.queue.cancel(pr, &reason, Utc::now()) {
                warn!(pr = %pr, reason = %reason, "cancelling entry at merge time");
                self.record(pr, "queue_cancelled", &cancelled, Some(reason));
            }
            return;
        }

        let Some(entry) = self.queue.begin_merge(pr, Utc::now()) else {
            // Superseded between selection and slot acquisition.
            debug!(pr = %pr, "entry vanished before merge start");
            return;
        };
        self.record(pr, "merge_started", &entry, None);

        match self.executor.merge(pr, &entry.head_sha).await {
            Ok(()) => {
                if let Some(done) = self.queue.complete(pr, Utc::now()) {
                    info!(pr = %pr, "merge completed");
                    self.record(pr, "merge_completed", &done, None);
                }
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(failed) = self.queue.fail(pr, message.clone(), Utc::now()) {
                    error!(pr = %pr, error = %message, "merge failed");
                    self.record(pr, "merge_failed", &failed, Some(message));
                }
            }
        }
    }

    /// Re-evaluates the entry against the current PR snapshot.
    ///
    /// Returns the cancellation reason if the entry must not merge. The
    /// evaluator's determinism makes this re-check idempotent: running it
    /// any number of times on the same snapshot gives the same verdict.
    fn recheck_failure(&self, entry: &QueueEntry) -> Option<String> {
        let Some(snapshot) = self.store.get(entry.pr) else {
            return Some("pull request no longer tracked".to_string());
        };
        // An entry merges only at the head it was admitted with.
        if snapshot.head_sha != entry.head_sha {
            return Some("superseded by new head commit".to_string());
        }
        match evaluate(&snapshot, &self.auto_merge_label) {
            Eligibility::Eligible => None,
            Eligibility::Ineligible(reason) => Some(format!("no longer eligible: {}", reason)),
        }
    }

    fn record(&self, pr: PrNumber, event: &str, entry: &QueueEntry, detail: Option<String>) {
        let mut new = NewAuditRecord::event(event).pr(pr);
        if let Some(detail) = detail {
            new = new.detail(detail);
        }
        if let Err(e) = self.audit.append(new) {
            // The transition already happened; the queue entry itself still
            // carries the outcome for the query surface.
            error!(pr = %pr, error = %e, "failed to append audit record");
        }
        let payload = serde_json::to_value(entry).unwrap_or_default();
        self.notifier.publish(event, Some(pr), payload);
    }
}
