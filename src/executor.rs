//! The merge executor collaborator interface.
//!
//! The queue worker drives merges through this trait; the engine never talks
//! to the code host directly. The worker calls [`MergeExecutor::merge`] at
//! most once per queue entry and never retries: a failed entry stays failed
//! until a fresh eligible admission is made after the underlying issue is
//! resolved.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

use crate::types::{PrNumber, Sha};

/// How a merge failure should be understood by an operator.
///
/// The classification is informational only: the queue treats every failure
/// as terminal for the entry regardless of kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeErrorKind {
    /// Infrastructure trouble (5xx, rate limit, network). A later admission
    /// will likely succeed without any change to the PR.
    Transient,
    /// The merge was rejected for a reason that needs a human (permissions,
    /// conflicts discovered at merge time, policy).
    Permanent,
    /// The PR head moved between admission and merge execution; the entry's
    /// snapshot is stale and a fresh eligibility pass is required.
    StaleHead,
}

/// A failed merge execution.
#[derive(Debug, Error)]
#[error("merge failed ({kind:?}): {message}")]
pub struct MergeError {
    pub kind: MergeErrorKind,
    pub message: String,
}

impl MergeError {
    pub fn transient(message: impl Into<String>) -> Self {
        MergeError {
            kind: MergeErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        MergeError {
            kind: MergeErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn stale_head(message: impl Into<String>) -> Self {
        MergeError {
            kind: MergeErrorKind::StaleHead,
            message: message.into(),
        }
    }
}

/// Performs the actual code-host merge.
///
/// Implementations must be safe to call at most once per queue entry: the
/// `head` argument is the commit the entry was admitted with, and the merge
/// must not proceed if the PR head has since moved.
#[async_trait]
pub trait MergeExecutor: Send + Sync {
    async fn merge(&self, pr: PrNumber, head: &Sha) -> Result<(), MergeError>;
}

/// An executor that merges nothing.
///
/// Used in tests and in dry-run deployments where no code-host credentials
/// are configured. Records every call so tests can assert on exactly which
/// merges were requested; can be primed to fail.
#[derive(Debug, Default)]
pub struct NullMergeExecutor {
    calls: Mutex<Vec<(PrNumber, Sha)>>,
    failure: Mutex<Option<String>>,
}

impl NullMergeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent merge call fail with the given message.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().expect("failure lock poisoned") = Some(message.into());
    }

    /// The merges requested so far, in call order.
    pub fn calls(&self) -> Vec<(PrNumber, Sha)> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock poisoned").len()
    }
}

#[async_trait]
impl MergeExecutor for NullMergeExecutor {
    async fn merge(&self, pr: PrNumber, head: &Sha) -> Result<(), MergeError> {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .push((pr, head.clone()));
        match self.failure.lock().expect("failure lock poisoned").as_ref() {
            Some(message) => Err(MergeError::permanent(message.clone())),
            None => Ok(()),
        }
    }
}
