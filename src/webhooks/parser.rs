//! Webhook payload parser.
//!
//! Parses raw webhook JSON payloads into typed [`DomainEvent`] values. The
//! parser is robust against unknown fields, event types, and actions:
//!
//! 1. The event type comes from the `X-GitHub-Event` header
//! 2. The payload is parsed according to the event type
//! 3. Unknown event types and actions return `Ok(None)` (ignored, not error)
//! 4. Malformed payloads return `Err` with details
//!
//! Check conclusions are folded into [`CheckState`]: `success`, `neutral`,
//! and `skipped` count as success for merge gating; every other conclusion
//! counts as failure. A check run that starts (or is re-requested) resets the
//! named check to pending.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::types::{CheckState, PrNumber, Sha};

use super::events::{
    CheckCompleted, DomainEvent, PullRequestClosed, PullRequestOpened, PullRequestUpdated,
    ReviewSubmitted, ReviewVerdict,
};

/// Error type for webhook parsing failures.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Field has an invalid value (e.g., malformed SHA, unknown state).
    #[error("invalid field value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Parses a webhook payload into a typed domain event.
///
/// # Returns
///
/// * `Ok(Some(event))` - successfully parsed a known event type and action
/// * `Ok(None)` - unknown event type or action (ignored, not an error)
/// * `Err(e)` - malformed payload or missing required fields
pub fn parse_webhook(event_type: &str, payload: &[u8]) -> Result<Option<DomainEvent>, ParseError> {
    match event_type {
        "pull_request" => parse_pull_request(payload),
        "pull_request_review" => parse_review(payload),
        "check_run" => parse_check_run(payload),
        // Unknown event types are ignored (not an error)
        _ => Ok(None),
    }
}

// ============================================================================
// Raw payload structures for deserialization
//
// These match the code host's webhook JSON structure. Optional fields are
// used liberally to tolerate missing data, with required fields validated
// explicitly afterwards.
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: u64,
    title: Option<String>,
    user: Option<RawUser>,
    head: RawRef,
    base: RawRef,
    #[serde(default)]
    labels: Vec<RawLabel>,
    mergeable: Option<bool>,
    #[serde(default)]
    merged: bool,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    action: String,
    pull_request: RawPullRequest,
}

fn head_sha(pr: &RawPullRequest) -> Result<Sha, ParseError> {
    let sha = pr.head.sha.as_deref().ok_or(ParseError::InvalidField {
        field: "pull_request.head.sha",
        value: "<missing>".to_string(),
    })?;
    Sha::parse(sha).map_err(|e| ParseError::InvalidField {
        field: "pull_request.head.sha",
        value: e.0,
    })
}

fn label_names(pr: &RawPullRequest) -> Vec<String> {
    pr.labels.iter().map(|l| l.name.clone()).collect()
}

fn parse_pull_request(payload: &[u8]) -> Result<Option<DomainEvent>, ParseError> {
    let raw: RawPullRequestPayload = serde_json::from_slice(payload)?;
    let pr = &raw.pull_request;
    let number = PrNumber(pr.number);

    match raw.action.as_str() {
        // A reopened PR re-enters tracking the same way a new one does.
        "opened" | "reopened" => Ok(Some(DomainEvent::PullRequestOpened(PullRequestOpened {
            number,
            title: pr.title.clone().unwrap_or_default(),
            author: pr.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
            head_branch: pr.head.branch.clone(),
            base_branch: pr.base.branch.clone(),
            head_sha: head_sha(pr)?,
            labels: label_names(pr),
            mergeable: pr.mergeable,
            opened_at: pr.created_at.unwrap_or_else(Utc::now),
        }))),
        "synchronize" => Ok(Some(DomainEvent::PullRequestUpdated(PullRequestUpdated {
            number,
            head_sha: head_sha(pr)?,
            labels: label_names(pr),
            mergeable: pr.mergeable,
            updated_at: pr.updated_at.unwrap_or_else(Utc::now),
        }))),
        "closed" => Ok(Some(DomainEvent::PullRequestClosed(PullRequestClosed {
            number,
            merged: pr.merged,
            closed_at: pr.closed_at.or(pr.updated_at).unwrap_or_else(Utc::now),
        }))),
        // Other actions (labeled, edited, assigned, ...) are ignored
        _ => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct RawReview {
    state: String,
    user: Option<RawUser>,
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawReviewPr {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct RawReviewPayload {
    action: String,
    review: RawReview,
    pull_request: RawReviewPr,
}

fn parse_review(payload: &[u8]) -> Result<Option<DomainEvent>, ParseError> {
    let raw: RawReviewPayload = serde_json::from_slice(payload)?;

    if raw.action != "submitted" {
        return Ok(None);
    }

    // Review states arrive lowercase in webhook payloads.
    let verdict = match raw.review.state.as_str() {
        "approved" => ReviewVerdict::Approved,
        "changes_requested" => ReviewVerdict::ChangesRequested,
        "commented" => ReviewVerdict::Commented,
        other => {
            return Err(ParseError::InvalidField {
                field: "review.state",
                value: other.to_string(),
            });
        }
    };

    Ok(Some(DomainEvent::ReviewSubmitted(ReviewSubmitted {
        number: PrNumber(raw.pull_request.number),
        verdict,
        reviewer: raw
            .review
            .user
            .map(|u| u.login)
            .unwrap_or_default(),
        submitted_at: raw.review.submitted_at.unwrap_or_else(Utc::now),
    })))
}

#[derive(Debug, Deserialize)]
struct RawCheckRun {
    name: String,
    conclusion: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pull_requests: Vec<RawReviewPr>,
}

#[derive(Debug, Deserialize)]
struct RawCheckRunPayload {
    action: String,
    check_run: RawCheckRun,
}

fn parse_check_run(payload: &[u8]) -> Result<Option<DomainEvent>, ParseError> {
    let raw: RawCheckRunPayload = serde_json::from_slice(payload)?;

    // A check run not associated with any PR cannot affect queue state.
    let Some(pr) = raw.check_run.pull_requests.first() else {
        return Ok(None);
    };
    let number = PrNumber(pr.number);

    let state = match raw.action.as_str() {
        "created" | "rerequested" => CheckState::Pending,
        "completed" => {
            let conclusion =
                raw.check_run
                    .conclusion
                    .as_deref()
                    .ok_or(ParseError::InvalidField {
                        field: "check_run.conclusion",
                        value: "<missing>".to_string(),
                    })?;
            match conclusion {
                "success" | "neutral" | "skipped" => CheckState::Success,
                _ => CheckState::Failure,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(DomainEvent::CheckCompleted(CheckCompleted {
        number,
        check_name: raw.check_run.name,
        state,
        completed_at: raw.check_run.completed_at.unwrap_or_else(Utc::now),
    })))
}
