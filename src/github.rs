//! Octocrab-backed merge executor.
//!
//! Performs the squash merge through the REST endpoint directly, because the
//! SHA guard parameter (merge only if the head still matches) is not exposed
//! by octocrab's high-level merge builder. The guard is what makes the merge
//! safe to issue from a snapshot taken at admission time: if anyone pushed to
//! the PR in between, the code host answers 409 instead of merging the wrong
//! code.
//!
//! Failures are classified into [`MergeErrorKind`] so operators can tell
//! infrastructure trouble from states needing a human, but the queue treats
//! all of them as terminal for the entry.

use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::executor::{MergeError, MergeExecutor};
use crate::types::{PrNumber, Sha};

/// A merge executor that performs squash merges against a single repository.
#[derive(Clone)]
pub struct GitHubMergeExecutor {
    client: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubMergeExecutor {
    /// Creates an executor from a pre-configured octocrab instance.
    pub fn new(client: Octocrab, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        GitHubMergeExecutor {
            client,
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Creates an executor authenticated with a personal access token.
    pub fn from_token(
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client, owner, repo))
    }
}

impl std::fmt::Debug for GitHubMergeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubMergeExecutor")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct MergeRequest<'a> {
    merge_method: &'static str,
    sha: &'a str,
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    merged: bool,
    message: Option<String>,
}

/// Checks if an error message indicates the head moved under us.
///
/// The code host returns HTTP 409 for several reasons (a stale SHA guard,
/// merge conflicts, ...); only the head-moved message means the entry's
/// snapshot is stale rather than the PR being unmergeable.
pub fn is_stale_head_error(err_str: &str) -> bool {
    err_str.to_lowercase().contains("head branch was modified")
}

/// Extracts the HTTP status code from an octocrab error, if present.
fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    match err {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

/// Returns true for messages describing infrastructure-level failures that a
/// later admission would likely not hit.
fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("base branch was modified")
}

/// Categorizes an octocrab error into a [`MergeError`].
fn classify(err: octocrab::Error) -> MergeError {
    let message = err.to_string();

    if is_stale_head_error(&message) {
        return MergeError::stale_head(message);
    }
    if is_transient_message(&message) {
        return MergeError::transient(message);
    }

    match extract_status_code(&err) {
        Some(429) => MergeError::transient(message),
        Some(code) if (500..600).contains(&code) => MergeError::transient(message),
        // 4xx without a recognizably transient message needs a human.
        Some(_) => MergeError::permanent(message),
        // No status code: treat unknown transport errors as transient.
        None => MergeError::transient(message),
    }
}

#[async_trait]
impl MergeExecutor for GitHubMergeExecutor {
    async fn merge(&self, pr: PrNumber, head: &Sha) -> Result<(), MergeError> {
        let url = format!("/repos/{}/{}/pulls/{}/merge", self.owner, self.repo, pr.0);
        let request = MergeRequest {
            merge_method: "squash",
            sha: head.as_str(),
        };

        info!(pr = %pr, head = %head.short(), "executing squash merge");

        let result: Result<MergeResponse, _> = self.client.put(&url, Some(&request)).await;
        match result {
            Ok(response) if response.merged => Ok(()),
            Ok(response) => Err(MergeError::permanent(format!(
                "merge request returned merged=false: {}",
                response.message.as_deref().unwrap_or("unknown reason")
            ))),
            Err(e) => {
                let err = classify(e);
                warn!(pr = %pr, error = %err, "merge execution failed");
                Err(err)
            }
        }
    }
}
