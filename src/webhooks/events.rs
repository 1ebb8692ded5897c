//! Typed domain events derived from webhook deliveries.
//!
//! The classifier maps each verified delivery to exactly one of these events
//! (or marks it duplicate/ignored). Events carry only the fields the store
//! needs; everything else in the raw payload is dropped at parse time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CheckState, PrNumber, Sha};

/// A classified domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A pull request was opened.
    PullRequestOpened(PullRequestOpened),

    /// A pull request's head moved (new commits pushed).
    PullRequestUpdated(PullRequestUpdated),

    /// A review was submitted on a pull request.
    ReviewSubmitted(ReviewSubmitted),

    /// A named check finished (or changed state) for a pull request head.
    CheckCompleted(CheckCompleted),

    /// A pull request was closed, with or without merging.
    PullRequestClosed(PullRequestClosed),
}

impl DomainEvent {
    /// The PR this event affects.
    pub fn pr_number(&self) -> PrNumber {
        match self {
            DomainEvent::PullRequestOpened(e) => e.number,
            DomainEvent::PullRequestUpdated(e) => e.number,
            DomainEvent::ReviewSubmitted(e) => e.number,
            DomainEvent::CheckCompleted(e) => e.number,
            DomainEvent::PullRequestClosed(e) => e.number,
        }
    }

    /// Stable event name used in audit records and notifications.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::PullRequestOpened(_) => "pull_request_opened",
            DomainEvent::PullRequestUpdated(_) => "pull_request_updated",
            DomainEvent::ReviewSubmitted(_) => "review_submitted",
            DomainEvent::CheckCompleted(_) => "check_completed",
            DomainEvent::PullRequestClosed(_) => "pull_request_closed",
        }
    }
}

/// A pull request was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestOpened {
    pub number: PrNumber,
    pub title: String,
    pub author: String,
    pub head_branch: String,
    pub base_branch: String,
    pub head_sha: Sha,
    pub labels: Vec<String>,
    /// The code host's conflict computation, when already available.
    /// `None` means not yet computed.
    pub mergeable: Option<bool>,
    pub opened_at: DateTime<Utc>,
}

/// A pull request's head moved.
///
/// Approval and check state recorded against the old head are stale relative
/// to the new code; the store clears them when applying this event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestUpdated {
    pub number: PrNumber,
    pub head_sha: Sha,
    /// Current label set, refreshed from the payload.
    pub labels: Vec<String>,
    pub mergeable: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

/// The verdict carried by a submitted review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
    Commented,
}

/// A review was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSubmitted {
    pub number: PrNumber,
    pub verdict: ReviewVerdict,
    pub reviewer: String,
    pub submitted_at: DateTime<Utc>,
}

/// A named check reported a state for a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCompleted {
    pub number: PrNumber,
    /// The check's name, the key in the per-PR check map.
    pub check_name: String,
    pub state: CheckState,
    pub completed_at: DateTime<Utc>,
}

/// A pull request was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestClosed {
    pub number: PrNumber,
    /// Whether the closure was a merge.
    pub merged: bool,
    pub closed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_sha() -> impl Strategy<Value = Sha> {
        "[0-9a-f]{40}".prop_map(|s| Sha::parse(s).unwrap())
    }

    fn arb_datetime() -> impl Strategy<Value = DateTime<Utc>> {
        (946684800i64..4102444800i64).prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap())
    }

    fn arb_verdict() -> impl Strategy<Value = ReviewVerdict> {
        prop_oneof![
            Just(ReviewVerdict::Approved),
            Just(ReviewVerdict::ChangesRequested),
            Just(ReviewVerdict::Commented),
        ]
    }

    fn arb_check_state() -> impl Strategy<Value = CheckState> {
        prop_oneof![
            Just(CheckState::Pending),
            Just(CheckState::Success),
            Just(CheckState::Failure),
        ]
    }

    fn arb_event() -> impl Strategy<Value = DomainEvent> {
        let opened = (
            1u64..10000,
            "[a-zA-Z0-9 ]{0,40}",
            "[a-z][a-z0-9]{0,15}",
            arb_sha(),
            proptest::collection::vec("[a-z-]{1,12}", 0..4),
            proptest::option::of(proptest::bool::ANY),
            arb_datetime(),
        )
            .prop_map(|(n, title, author, sha, labels, mergeable, ts)| {
                DomainEvent::PullRequestOpened(PullRequestOpened {
                    number: PrNumber(n),
                    title,
                    author,
                    head_branch: "feature".to_string(),
                    base_branch: "main".to_string(),
                    head_sha: sha,
                    labels,
                    mergeable,
                    opened_at: ts,
                })
            });

        let review = (1u64..10000, arb_verdict(), "[a-z]{1,10}", arb_datetime()).prop_map(
            |(n, verdict, reviewer, ts)| {
                DomainEvent::ReviewSubmitted(ReviewSubmitted {
                    number: PrNumber(n),
                    verdict,
                    reviewer,
                    submitted_at: ts,
                })
            },
        );

        let check = (1u64..10000, "[a-z/-]{1,20}", arb_check_state(), arb_datetime()).prop_map(
            |(n, name, state, ts)| {
                DomainEvent::CheckCompleted(CheckCompleted {
                    number: PrNumber(n),
                    check_name: name,
                    state,
                    completed_at: ts,
                })
            },
        );

        prop_oneof![opened, review, check]
    }

    proptest! {
        #[test]
        fn event_serde_roundtrip(event in arb_event()) {
            let json = serde_json::to_string(&event).unwrap();
            let parsed: DomainEvent = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(event, parsed);
        }

        #[test]
        fn name_matches_variant(event in arb_event()) {
            let name = event.name();
            match event {
                DomainEvent::PullRequestOpened(_) => prop_assert_eq!(name, "pull_request_opened"),
                DomainEvent::PullRequestUpdated(_) => prop_assert_eq!(name, "pull_request_updated"),
                DomainEvent::ReviewSubmitted(_) => prop_assert_eq!(name, "review_submitted"),
                DomainEvent::CheckCompleted(_) => prop_assert_eq!(name, "check_completed"),
                DomainEvent::PullRequestClosed(_) => prop_assert_eq!(name, "pull_request_closed"),
            }
        }
    }

    #[test]
    fn verdict_json_format() {
        assert_eq!(
            serde_json::to_string(&ReviewVerdict::ChangesRequested).unwrap(),
            "\"changes_requested\""
        );
    }
}
