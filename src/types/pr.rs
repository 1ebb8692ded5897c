//! Pull request state as tracked by the bot.
//!
//! The [`PullRequest`] record is the authoritative per-PR state, owned by the
//! store and mutated only through classified domain events. Invariants:
//!
//! - `Merged` implies closed: [`PrState::is_closed`] is true for both
//!   `Closed` and `Merged`.
//! - The aggregate [`ChecksStatus`] is `Success` only when at least one check
//!   is recorded and every recorded check is `Success`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PrNumber, Sha};

/// The lifecycle state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    /// The PR is open.
    Open,
    /// The PR was closed without merging.
    Closed,
    /// The PR was merged (which also closes it).
    Merged,
}

impl PrState {
    /// Returns true if the PR is open.
    pub fn is_open(&self) -> bool {
        matches!(self, PrState::Open)
    }

    /// Returns true if the PR is closed, whether merged or not.
    pub fn is_closed(&self) -> bool {
        matches!(self, PrState::Closed | PrState::Merged)
    }

    /// Returns true if the PR was merged.
    pub fn is_merged(&self) -> bool {
        matches!(self, PrState::Merged)
    }
}

/// The reported status of a single named check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
}

/// The aggregate status rolled up from all recorded checks.
///
/// `Success` requires at least one recorded check; a PR with no checks at all
/// is `Pending`, never `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksStatus {
    Pending,
    Success,
    Failure,
}

impl ChecksStatus {
    /// Rolls up individual check states into the aggregate status.
    pub fn aggregate<'a>(checks: impl IntoIterator<Item = &'a CheckState>) -> ChecksStatus {
        let mut any = false;
        let mut all_success = true;
        for check in checks {
            any = true;
            match check {
                CheckState::Failure => return ChecksStatus::Failure,
                CheckState::Pending => all_success = false,
                CheckState::Success => {}
            }
        }
        if any && all_success {
            ChecksStatus::Success
        } else {
            ChecksStatus::Pending
        }
    }
}

/// A recorded approval on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// Login of the approving reviewer.
    pub approver: String,
    /// When the approval was submitted.
    pub approved_at: DateTime<Utc>,
}

/// The tracked state of one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// The PR number (unique key).
    pub number: PrNumber,

    /// The PR title.
    pub title: String,

    /// Login of the PR author.
    pub author: String,

    /// The PR's source branch.
    pub head_branch: String,

    /// The branch the PR targets.
    pub base_branch: String,

    /// The current head commit of the PR branch.
    pub head_sha: Sha,

    /// Lifecycle state.
    pub state: PrState,

    /// The PR's current label set.
    pub labels: BTreeSet<String>,

    /// The recorded approval, if any. Cleared when the head moves.
    pub approval: Option<Approval>,

    /// Per-check-name statuses. Cleared when the head moves.
    pub checks: BTreeMap<String, CheckState>,

    /// Aggregate status derived from `checks`.
    pub checks_status: ChecksStatus,

    /// Whether the PR currently has merge conflicts against its base.
    pub has_conflicts: bool,

    /// When the PR was opened.
    pub created_at: DateTime<Utc>,

    /// When the PR state last changed.
    pub updated_at: DateTime<Utc>,

    /// When the PR was closed, if it has been.
    pub closed_at: Option<DateTime<Utc>>,

    /// When the PR was merged, if it has been.
    pub merged_at: Option<DateTime<Utc>>,
}

impl PullRequest {
    /// Creates a fresh open PR record with empty approval and check state.
    pub fn new(number: PrNumber, head_sha: Sha, created_at: DateTime<Utc>) -> Self {
        PullRequest {
            number,
            title: String::new(),
            author: String::new(),
            head_branch: String::new(),
            base_branch: String::new(),
            head_sha,
            state: PrState::Open,
            labels: BTreeSet::new(),
            approval: None,
            checks: BTreeMap::new(),
            checks_status: ChecksStatus::Pending,
            has_conflicts: false,
            created_at,
            updated_at: created_at,
            closed_at: None,
            merged_at: None,
        }
    }

    /// Recomputes the aggregate checks status from the per-check map.
    pub fn recompute_checks_status(&mut self) {
        self.checks_status = ChecksStatus::aggregate(self.checks.values());
    }

    /// Returns true if the author looks like an automation account.
    ///
    /// GitHub App accounts carry a `[bot]` suffix on their login.
    pub fn author_is_bot(&self) -> bool {
        self.author.ends_with("[bot]")
    }

    /// Returns true if the PR carries the given label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Produces the minimal snapshot used for audit before/after diffs.
    pub fn summary(&self) -> PrSummary {
        PrSummary {
            state: self.state,
            head_sha: self.head_sha.clone(),
            approved: self.approval.is_some(),
            checks_status: self.checks_status,
            has_conflicts: self.has_conflicts,
        }
    }
}

/// The minimal PR snapshot recorded in audit before/after diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrSummary {
    pub state: PrState,
    pub head_sha: Sha,
    pub approved: bool,
    pub checks_status: ChecksStatus,
    pub has_conflicts: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pr(number: u64) -> PullRequest {
        PullRequest::new(PrNumber(number), Sha::new("a".repeat(40)), Utc::now())
    }

    #[test]
    fn merged_implies_closed() {
        assert!(PrState::Merged.is_closed());
        assert!(PrState::Closed.is_closed());
        assert!(!PrState::Open.is_closed());
    }

    #[test]
    fn aggregate_empty_is_pending() {
        let checks: [CheckState; 0] = [];
        assert_eq!(ChecksStatus::aggregate(checks.iter()), ChecksStatus::Pending);
    }

    #[test]
    fn aggregate_all_success() {
        let checks = [CheckState::Success, CheckState::Success];
        assert_eq!(ChecksStatus::aggregate(checks.iter()), ChecksStatus::Success);
    }

    #[test]
    fn aggregate_any_failure_wins() {
        let checks = [CheckState::Success, CheckState::Failure, CheckState::Pending];
        assert_eq!(ChecksStatus::aggregate(checks.iter()), ChecksStatus::Failure);
    }

    #[test]
    fn aggregate_pending_blocks_success() {
        let checks = [CheckState::Success, CheckState::Pending];
        assert_eq!(ChecksStatus::aggregate(checks.iter()), ChecksStatus::Pending);
    }

    #[test]
    fn bot_author_detection() {
        let mut p = pr(1);
        p.author = "dependabot[bot]".to_string();
        assert!(p.author_is_bot());

        p.author = "octocat".to_string();
        assert!(!p.author_is_bot());
    }

    #[test]
    fn recompute_tracks_check_map() {
        let mut p = pr(1);
        p.checks.insert("build".to_string(), CheckState::Success);
        p.recompute_checks_status();
        assert_eq!(p.checks_status, ChecksStatus::Success);

        p.checks.insert("lint".to_string(), CheckState::Failure);
        p.recompute_checks_status();
        assert_eq!(p.checks_status, ChecksStatus::Failure);
    }

    proptest! {
        /// The aggregate is Success exactly when the map is non-empty and
        /// every entry is Success.
        #[test]
        fn aggregate_success_characterization(
            states in proptest::collection::vec(
                prop_oneof![
                    Just(CheckState::Pending),
                    Just(CheckState::Success),
                    Just(CheckState::Failure),
                ],
                0..8,
            )
        ) {
            let agg = ChecksStatus::aggregate(states.iter());
            let expect_success =
                !states.is_empty() && states.iter().all(|s| *s == CheckState::Success);
            prop_assert_eq!(agg == ChecksStatus::Success, expect_success);
        }

        #[test]
        fn pull_request_serde_roundtrip(number in 1u64..10000) {
            let p = pr(number);
            let json = serde_json::to_string(&p).unwrap();
            let parsed: PullRequest = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(p, parsed);
        }
    }
}
