//! The authoritative pull request store.
//!
//! The store owns every tracked [`PullRequest`] record and is the only place
//! they are mutated. Each [`apply`](PullRequestStore::apply) is atomic: the
//! whole mutation happens under the store lock and the returned snapshot is
//! exactly the state the event produced, so downstream stages never observe a
//! partial write or a stale read. Cross-PR pipeline concurrency is handled by
//! the engine's per-PR guards; see [`crate::engine`].
//!
//! # Mutation rules
//!
//! - `PullRequestOpened` creates (or refreshes) the record in the open state.
//! - `ReviewSubmitted` records or clears the approval, unless the PR is
//!   already closed.
//! - `CheckCompleted` upserts the named check and recomputes the aggregate.
//! - `PullRequestUpdated` moves the head and clears approval, checks, and the
//!   conflict flag, all stale relative to the new code.
//! - `PullRequestClosed` closes (and possibly marks merged).
//!
//! Events other than `PullRequestOpened` for an unknown PR create a minimal
//! open record, so out-of-order deliveries (a check finishing before the
//! `opened` delivery arrives) are not lost. The later `opened` fills in the
//! descriptive fields.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::types::{Approval, PrNumber, PrState, PullRequest, Sha};
use crate::webhooks::events::{DomainEvent, ReviewVerdict};

/// In-memory table of tracked pull requests.
#[derive(Debug, Default)]
pub struct PullRequestStore {
    inner: Mutex<HashMap<PrNumber, PullRequest>>,
}

impl PullRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one classified domain event, creating the record on first
    /// sight, and returns the resulting snapshot.
    pub fn apply(&self, event: &DomainEvent) -> PullRequest {
        let mut table = self.inner.lock().expect("pull request table lock poisoned");
        let number = event.pr_number();

        let record = table.entry(number).or_insert_with(|| {
            debug!(pr = %number, "creating pull request record");
            PullRequest::new(number, Sha::new(""), Utc::now())
        });

        match event {
            DomainEvent::PullRequestOpened(e) => {
                record.title = e.title.clone();
                record.author = e.author.clone();
                record.head_branch = e.head_branch.clone();
                record.base_branch = e.base_branch.clone();
                record.head_sha = e.head_sha.clone();
                record.state = PrState::Open;
                record.labels = e.labels.iter().cloned().collect::<BTreeSet<_>>();
                record.has_conflicts = e.mergeable == Some(false);
                record.created_at = e.opened_at;
                record.updated_at = e.opened_at;
                record.closed_at = None;
                record.merged_at = None;
            }
            DomainEvent::PullRequestUpdated(e) => {
                record.head_sha = e.head_sha.clone();
                record.labels = e.labels.iter().cloned().collect::<BTreeSet<_>>();
                // Approval and check results were recorded against the old
                // head; the conflict flag awaits re-computation.
                record.approval = None;
                record.checks.clear();
                record.recompute_checks_status();
                record.has_conflicts = e.mergeable == Some(false);
                record.updated_at = e.updated_at;
            }
            DomainEvent::ReviewSubmitted(e) => {
                if !record.state.is_closed() {
                    match e.verdict {
                        ReviewVerdict::Approved => {
                            record.approval = Some(Approval {
                                approver: e.reviewer.clone(),
                                approved_at: e.submitted_at,
                            });
                        }
                        ReviewVerdict::ChangesRequested => {
                            record.approval = None;
                        }
                        ReviewVerdict::Commented => {}
                    }
                    record.updated_at = e.submitted_at;
                }
            }
            DomainEvent::CheckCompleted(e) => {
                record.checks.insert(e.check_name.clone(), e.state);
                record.recompute_checks_status();
                record.updated_at = e.completed_at;
            }
            DomainEvent::PullRequestClosed(e) => {
                record.state = if e.merged { PrState::Merged } else { PrState::Closed };
                record.closed_at = Some(e.closed_at);
                if e.merged {
                    record.merged_at = Some(e.closed_at);
                }
                record.updated_at = e.closed_at;
            }
        }

        record.clone()
    }

    /// Returns a snapshot of the PR, if tracked.
    pub fn get(&self, number: PrNumber) -> Option<PullRequest> {
        self.inner
            .lock()
            .expect("pull request table lock poisoned")
            .get(&number)
            .cloned()
    }

    /// Number of tracked PRs.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("pull request table lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops records for PRs closed longer than `retention` ago.
    ///
    /// Returns the number of records removed. History remains available
    /// through the audit log.
    pub fn prune_closed(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let mut table = self.inner.lock().expect("pull request table lock poisoned");
        let before = table.len();
        table.retain(|_, pr| match pr.closed_at {
            Some(closed_at) if pr.state.is_closed() => now - closed_at < retention,
            _ => true,
        });
        before - table.len()
    }
}
