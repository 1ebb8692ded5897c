//! The serialized merge queue.
//!
//! Each admission creates a [`QueueEntry`] tied to a PR at a specific head
//! commit. The entry state machine is:
//!
//! ```text
//! queued ──► merging ──► completed
//!    │           └─────► failed
//!    └─────► cancelled
//! ```
//!
//! Invariants:
//!
//! - At most one entry per PR number is in a non-terminal status at a time
//!   (idempotent admission).
//! - At most one entry across the whole queue is `merging` at a time; the
//!   [`worker`] is the only place that transition happens.
//! - A `queued` entry can be cancelled at any moment (supersession, manual
//!   removal); a `merging` entry cannot: the in-flight merge completes and
//!   is reconciled by follow-up events.
//!
//! Admission order is FIFO by `entered_at`. Before an entry may start
//! merging it must dwell in the queue for the configured soak time, giving
//! late-arriving signals (a new commit, a failing check) a window to
//! supersede it.

pub mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::{PrNumber, Sha};

/// Terminal entries kept for the query surface after leaving the active set.
const HISTORY_LIMIT: usize = 256;

/// Soak durations by author kind.
///
/// Bot-authored PRs soak longer: nobody is watching them, so the queue
/// itself provides the reaction window.
#[derive(Debug, Clone, Copy)]
pub struct SoakPolicy {
    pub human: Duration,
    pub bot: Duration,
}

impl SoakPolicy {
    pub fn for_author(&self, bot_author: bool) -> Duration {
        if bot_author { self.bot } else { self.human }
    }
}

impl Default for SoakPolicy {
    fn default() -> Self {
        SoakPolicy {
            human: Duration::from_secs(60),
            bot: Duration::from_secs(600),
        }
    }
}

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Queued,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl QueueEntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueEntryStatus::Completed | QueueEntryStatus::Failed | QueueEntryStatus::Cancelled
        )
    }
}

/// One admission into the merge queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    /// The PR this entry merges.
    pub pr: PrNumber,
    /// The head commit the entry was admitted with. The merge executes
    /// against exactly this commit or not at all.
    pub head_sha: Sha,
    /// Whether the PR author is an automation account (drives soak choice).
    pub bot_author: bool,
    pub status: QueueEntryStatus,
    pub entered_at: DateTime<Utc>,
    pub merge_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Error or cancellation detail for `failed` / `cancelled` entries.
    pub error_message: Option<String>,
    /// Monotonic soak deadline; not part of the wire representation.
    #[serde(skip)]
    ready_at: Option<Instant>,
}

impl QueueEntry {
    /// Seconds the entry spent queued before reaching a terminal state or
    /// starting its merge.
    fn queue_seconds(&self) -> Option<f64> {
        let end = self.merge_started_at.or(self.completed_at)?;
        Some((end - self.entered_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    /// A fresh entry was created.
    Admitted(QueueEntry),
    /// An active entry for this PR already exists; admission is a no-op.
    AlreadyActive,
}

/// What the worker should do next.
#[derive(Debug)]
pub(crate) enum Next {
    /// Nothing queued (or a merge is in flight).
    Idle,
    /// The oldest queued entry is still soaking until this deadline.
    Wait(Instant),
    /// This entry has soaked and may merge.
    Ready(QueueEntry),
}

#[derive(Debug, Default)]
struct QueueInner {
    active: HashMap<PrNumber, QueueEntry>,
    /// The PR currently holding the global merging slot, if any.
    merging: Option<PrNumber>,
    history: VecDeque<QueueEntry>,
    completed_count: u64,
    failed_count: u64,
    cancelled_count: u64,
    /// Sum of queued-time for completed merges, for the average metric.
    completed_queue_seconds: f64,
}

impl QueueInner {
    fn retire(&mut self, entry: QueueEntry) {
        self.history.push_back(entry);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

/// Aggregate queue metrics for the query surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    /// Entries currently queued or merging.
    pub depth: usize,
    /// 0 or 1 by the global serialization invariant.
    pub merging: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
    /// Average seconds from admission to merge start, over completed merges.
    pub avg_queue_seconds: Option<f64>,
    /// Merges completed in the last hour.
    pub merged_last_hour: u64,
}

/// The merge queue: admission, supersession, and the global merging slot.
#[derive(Debug)]
pub struct MergeQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    soak: SoakPolicy,
}

impl MergeQueue {
    pub fn new(soak: SoakPolicy) -> Self {
        MergeQueue {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            soak,
        }
    }

    /// Admits a PR at the given head commit.
    ///
    /// Idempotent: if an active (non-terminal) entry already exists for the
    /// PR, nothing changes.
    pub fn admit(
        &self,
        pr: PrNumber,
        head_sha: Sha,
        bot_author: bool,
        now: DateTime<Utc>,
    ) -> AdmitOutcome {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.active.contains_key(&pr) {
            debug!(pr = %pr, "admission no-op: entry already active");
            return AdmitOutcome::AlreadyActive;
        }

        let soak = self.soak.for_author(bot_author);
        let entry = QueueEntry {
            pr,
            head_sha,
            bot_author,
            status: QueueEntryStatus::Queued,
            entered_at: now,
            merge_started_at: None,
            completed_at: None,
            error_message: None,
            ready_at: Some(Instant::now() + soak),
        };
        inner.active.insert(pr, entry.clone());
        drop(inner);

        info!(pr = %pr, head = %entry.head_sha.short(), soak_secs = soak.as_secs(), "admitted to merge queue");
        self.notify.notify_one();
        AdmitOutcome::Admitted(entry)
    }

    /// Cancels the PR's queued entry, if it has one.
    ///
    /// Returns the cancelled entry, or `None` when there is nothing to
    /// cancel: no active entry, or the entry is already `merging` (the
    /// merge is allowed to finish and is reconciled afterwards).
    pub fn cancel(&self, pr: PrNumber, reason: &str, now: DateTime<Utc>) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        match inner.active.get(&pr) {
            Some(entry) if entry.status == QueueEntryStatus::Queued => {}
            _ => return None,
        }

        let mut entry = inner.active.remove(&pr).expect("entry checked above");
        entry.status = QueueEntryStatus::Cancelled;
        entry.completed_at = Some(now);
        entry.error_message = Some(reason.to_string());
        inner.cancelled_count += 1;
        inner.retire(entry.clone());
        drop(inner);

        info!(pr = %pr, reason = %reason, "queue entry cancelled");
        self.notify.notify_one();
        Some(entry)
    }

    /// Selects the worker's next action. Does not mutate the queue.
    pub(crate) fn next(&self) -> Next {
        let inner = self.inner.lock().expect("queue lock poisoned");
        if inner.merging.is_some() {
            return Next::Idle;
        }
        let oldest = inner
            .active
            .values()
            .filter(|e| e.status == QueueEntryStatus::Queued)
            .min_by_key(|e| (e.entered_at, e.pr));
        match oldest {
            None => Next::Idle,
            Some(entry) => match entry.ready_at {
                Some(ready_at) if ready_at > Instant::now() => Next::Wait(ready_at),
                _ => Next::Ready(entry.clone()),
            },
        }
    }

    /// Moves the entry into the global merging slot.
    ///
    /// Returns `None` if the entry is gone (superseded while the worker was
    /// deciding) or the slot is taken.
    pub(crate) fn begin_merge(&self, pr: PrNumber, now: DateTime<Utc>) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.merging.is_some() {
            return None;
        }
        let entry = inner.active.get_mut(&pr)?;
        if entry.status != QueueEntryStatus::Queued {
            return None;
        }
        entry.status = QueueEntryStatus::Merging;
        entry.merge_started_at = Some(now);
        let snapshot = entry.clone();
        inner.merging = Some(pr);
        Some(snapshot)
    }

    /// Marks the merging entry completed.
    pub(crate) fn complete(&self, pr: PrNumber, now: DateTime<Utc>) -> Option<QueueEntry> {
        self.finish(pr, now, QueueEntryStatus::Completed, None)
    }

    /// Marks the merging entry failed with the given error detail.
    pub(crate) fn fail(&self, pr: PrNumber, error: String, now: DateTime<Utc>) -> Option<QueueEntry> {
        self.finish(pr, now, QueueEntryStatus::Failed, Some(error))
    }

    fn finish(
        &self,
        pr: PrNumber,
        now: DateTime<Utc>,
        status: QueueEntryStatus,
        error: Option<String>,
    ) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.merging != Some(pr) {
            return None;
        }
        let mut entry = inner.active.remove(&pr)?;
        entry.status = status;
        entry.completed_at = Some(now);
        entry.error_message = error;
        inner.merging = None;
        match status {
            QueueEntryStatus::Completed => {
                inner.completed_count += 1;
                if let Some(secs) = entry.queue_seconds() {
                    inner.completed_queue_seconds += secs;
                }
            }
            QueueEntryStatus::Failed => inner.failed_count += 1,
            _ => {}
        }
        inner.retire(entry.clone());
        drop(inner);

        self.notify.notify_one();
        Some(entry)
    }

    /// Waits until the queue changes (admission, cancellation, completion).
    pub(crate) async fn changed(&self) {
        self.notify.notified().await;
    }

    /// The PR's active entry, if any.
    pub fn active_entry(&self, pr: PrNumber) -> Option<QueueEntry> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .active
            .get(&pr)
            .cloned()
    }

    /// All active entries, oldest first.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut entries: Vec<_> = inner.active.values().cloned().collect();
        entries.sort_by_key(|e| (e.entered_at, e.pr));
        entries
    }

    /// The most recent terminal entries, oldest first.
    pub fn recent_history(&self, limit: usize) -> Vec<QueueEntry> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let start = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(start).cloned().collect()
    }

    /// Number of entries currently in `merging` status (0 or 1).
    pub fn merging_count(&self) -> usize {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .active
            .values()
            .filter(|e| e.status == QueueEntryStatus::Merging)
            .count()
    }

    /// Aggregate metrics for the query surface.
    pub fn metrics(&self, now: DateTime<Utc>) -> QueueMetrics {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let merging = inner.merging.iter().count();
        let merged_last_hour = inner
            .history
            .iter()
            .filter(|e| {
                e.status == QueueEntryStatus::Completed
                    && e.completed_at
                        .map(|t| now - t < chrono::Duration::hours(1))
                        .unwrap_or(false)
            })
            .count() as u64;
        QueueMetrics {
            depth: inner.active.len(),
            merging,
            completed_total: inner.completed_count,
            failed_total: inner.failed_count,
            cancelled_total: inner.cancelled_count,
            avg_queue_seconds: if inner.completed_count > 0 {
                Some(inner.completed_queue_seconds / inner.completed_count as f64)
            } else {
                None
            },
            merged_last_hour,
        }
    }
}
