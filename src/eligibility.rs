//! Merge eligibility evaluation.
//!
//! [`evaluate`] is a pure function from a PR snapshot to an admit/reject
//! verdict. It performs no I/O and is deterministic for a given snapshot;
//! the merge queue relies on that determinism to re-check entries
//! idempotently before executing a merge.
//!
//! When several conditions fail at once, the first failing reason in this
//! fixed precedence is reported: not open > missing label > not approved >
//! checks not successful > conflicts present.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ChecksStatus, PullRequest};

/// The verdict for queueing a PR for merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Why a PR cannot be admitted to the merge queue.
///
/// Not an error: a normal terminal classification with a stable reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    /// The PR is closed or merged.
    NotOpen,
    /// The PR does not carry the auto-merge label.
    MissingLabel,
    /// No approval is recorded.
    NotApproved,
    /// The aggregate checks status is not success.
    ChecksNotSuccessful,
    /// The PR has merge conflicts against its base.
    HasConflicts,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IneligibleReason::NotOpen => "pull request is not open",
            IneligibleReason::MissingLabel => "auto-merge label not present",
            IneligibleReason::NotApproved => "no approval recorded",
            IneligibleReason::ChecksNotSuccessful => "checks not successful",
            IneligibleReason::HasConflicts => "merge conflicts present",
        };
        write!(f, "{}", text)
    }
}

/// Evaluates whether a PR snapshot may be admitted to the merge queue.
pub fn evaluate(pr: &PullRequest, auto_merge_label: &str) -> Eligibility {
    if !pr.state.is_open() {
        return Eligibility::Ineligible(IneligibleReason::NotOpen);
    }
    if !pr.has_label(auto_merge_label) {
        return Eligibility::Ineligible(IneligibleReason::MissingLabel);
    }
    if pr.approval.is_none() {
        return Eligibility::Ineligible(IneligibleReason::NotApproved);
    }
    if pr.checks_status != ChecksStatus::Success {
        return Eligibility::Ineligible(IneligibleReason::ChecksNotSuccessful);
    }
    if pr.has_conflicts {
        return Eligibility::Ineligible(IneligibleReason::HasConflicts);
    }
    Eligibility::Eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Approval, CheckState, PrNumber, PrState, PullRequest, Sha};
    use chrono::Utc;
    use proptest::prelude::*;

    const LABEL: &str = "auto-merge";

    /// A PR that satisfies every admission condition.
    fn eligible_pr() -> PullRequest {
        let mut pr = PullRequest::new(PrNumber(100), Sha::new("a".repeat(40)), Utc::now());
        pr.labels.insert(LABEL.to_string());
        pr.approval = Some(Approval {
            approver: "reviewer".to_string(),
            approved_at: Utc::now(),
        });
        pr.checks.insert("build".to_string(), CheckState::Success);
        pr.recompute_checks_status();
        pr
    }

    #[test]
    fn fully_green_pr_is_eligible() {
        assert_eq!(evaluate(&eligible_pr(), LABEL), Eligibility::Eligible);
    }

    #[test]
    fn closed_pr_is_ineligible() {
        let mut pr = eligible_pr();
        pr.state = PrState::Closed;
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::NotOpen)
        );
    }

    #[test]
    fn missing_label_is_ineligible() {
        let mut pr = eligible_pr();
        pr.labels.clear();
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::MissingLabel)
        );
    }

    #[test]
    fn unapproved_pr_is_ineligible() {
        let mut pr = eligible_pr();
        pr.approval = None;
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::NotApproved)
        );
    }

    #[test]
    fn failing_checks_are_ineligible() {
        let mut pr = eligible_pr();
        pr.checks.insert("lint".to_string(), CheckState::Failure);
        pr.recompute_checks_status();
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::ChecksNotSuccessful)
        );
    }

    #[test]
    fn no_checks_at_all_is_not_success() {
        let mut pr = eligible_pr();
        pr.checks.clear();
        pr.recompute_checks_status();
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::ChecksNotSuccessful)
        );
    }

    #[test]
    fn conflicts_are_ineligible() {
        let mut pr = eligible_pr();
        pr.has_conflicts = true;
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::HasConflicts)
        );
    }

    #[test]
    fn precedence_reports_first_failing_reason() {
        // Everything wrong at once: closed wins.
        let mut pr = eligible_pr();
        pr.state = PrState::Merged;
        pr.labels.clear();
        pr.approval = None;
        pr.checks.clear();
        pr.recompute_checks_status();
        pr.has_conflicts = true;
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::NotOpen)
        );

        // Open but unlabeled: label precedes approval.
        pr.state = PrState::Open;
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::MissingLabel)
        );

        // Labeled but unapproved: approval precedes checks.
        pr.labels.insert(LABEL.to_string());
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::NotApproved)
        );

        // Approved but checks pending: checks precede conflicts.
        pr.approval = Some(Approval {
            approver: "r".to_string(),
            approved_at: Utc::now(),
        });
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::ChecksNotSuccessful)
        );

        // Only conflicts left.
        pr.checks.insert("build".to_string(), CheckState::Success);
        pr.recompute_checks_status();
        assert_eq!(
            evaluate(&pr, LABEL),
            Eligibility::Ineligible(IneligibleReason::HasConflicts)
        );
    }

    proptest! {
        /// evaluate is deterministic: two calls on the same snapshot agree.
        #[test]
        fn deterministic_for_identical_snapshots(
            open in proptest::bool::ANY,
            labeled in proptest::bool::ANY,
            approved in proptest::bool::ANY,
            check_state in prop_oneof![
                Just(None),
                Just(Some(CheckState::Pending)),
                Just(Some(CheckState::Success)),
                Just(Some(CheckState::Failure)),
            ],
            conflicts in proptest::bool::ANY,
        ) {
            let mut pr = PullRequest::new(PrNumber(1), Sha::new("a".repeat(40)), Utc::now());
            if !open {
                pr.state = PrState::Closed;
            }
            if labeled {
                pr.labels.insert(LABEL.to_string());
            }
            if approved {
                pr.approval = Some(Approval {
                    approver: "r".to_string(),
                    approved_at: Utc::now(),
                });
            }
            if let Some(state) = check_state {
                pr.checks.insert("build".to_string(), state);
            }
            pr.recompute_checks_status();
            pr.has_conflicts = conflicts;

            let first = evaluate(&pr, LABEL);
            let second = evaluate(&pr, LABEL);
            prop_assert_eq!(first, second);

            // Eligible exactly when every condition holds.
            let expect_eligible = open
                && labeled
                && approved
                && check_state == Some(CheckState::Success)
                && !conflicts;
            prop_assert_eq!(first.is_eligible(), expect_eligible);
        }
    }
}
