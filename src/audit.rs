//! Append-only audit log.
//!
//! Every accepted delivery and every state transition appends exactly one
//! record; records are never edited or removed, and sequence numbers increase
//! monotonically. The log is the sole source of historical truth.
//!
//! The durable form is JSON Lines: one record per line, fsynced on append.
//! The format is crash-safe because complete lines are always valid JSON and
//! a partial line from a crash mid-write is detected and truncated on
//! startup. An in-memory mirror serves the read-only query surface.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::{DeliveryId, PrNumber, PrSummary};

/// Errors that can occur during audit log operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for audit log operations.
pub type Result<T> = std::result::Result<T, AuditError>;

/// One immutable audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonically increasing sequence number; the sole ordering guarantee.
    pub seq: u64,
    /// When the record was appended.
    pub ts: DateTime<Utc>,
    /// The delivery that caused this record, when one did. Queue-worker
    /// transitions (merge start/completion) have no triggering delivery.
    pub delivery_id: Option<DeliveryId>,
    /// The derived event name (e.g., "pull_request_opened", "merge_failed").
    pub event: String,
    /// The affected PR, when the record concerns one.
    pub pr_number: Option<PrNumber>,
    /// Minimal PR snapshot before the transition.
    pub before: Option<PrSummary>,
    /// Minimal PR snapshot after the transition.
    pub after: Option<PrSummary>,
    /// Human-readable outcome detail (eligibility reason, error message, ...).
    pub detail: Option<String>,
}

/// The mutable fields of a record about to be appended.
///
/// `seq` and `ts` are assigned by the log at append time.
#[derive(Debug, Clone, Default)]
pub struct NewAuditRecord {
    pub delivery_id: Option<DeliveryId>,
    pub event: String,
    pub pr_number: Option<PrNumber>,
    pub before: Option<PrSummary>,
    pub after: Option<PrSummary>,
    pub detail: Option<String>,
}

impl NewAuditRecord {
    pub fn event(event: impl Into<String>) -> Self {
        NewAuditRecord {
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn delivery(mut self, id: DeliveryId) -> Self {
        self.delivery_id = Some(id);
        self
    }

    pub fn pr(mut self, number: PrNumber) -> Self {
        self.pr_number = Some(number);
        self
    }

    pub fn before(mut self, summary: Option<PrSummary>) -> Self {
        self.before = summary;
        self
    }

    pub fn after(mut self, summary: PrSummary) -> Self {
        self.after = Some(summary);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

struct AuditLogInner {
    /// Open append handle; `None` for an in-memory log.
    file: Option<File>,
    next_seq: u64,
    records: Vec<AuditRecord>,
}

/// The append-only audit log with its in-memory mirror.
pub struct AuditLog {
    inner: Mutex<AuditLogInner>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Opens (or creates) a durable log at `path`, replaying existing records.
    ///
    /// A torn final line (crash mid-write) is truncated away so the file
    /// always contains a valid prefix of records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (records, valid_len, file_len) = replay(&path)?;
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "truncating torn tail of audit log"
            );
            let f = OpenOptions::new().write(true).open(&path)?;
            f.set_len(valid_len)?;
            f.sync_all()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let next_seq = records.last().map(|r| r.seq + 1).unwrap_or(0);

        Ok(AuditLog {
            inner: Mutex::new(AuditLogInner {
                file: Some(file),
                next_seq,
                records,
            }),
            path: Some(path),
        })
    }

    /// Creates a log with no durable backing. Used in tests and dry runs.
    pub fn in_memory() -> Self {
        AuditLog {
            inner: Mutex::new(AuditLogInner {
                file: None,
                next_seq: 0,
                records: Vec::new(),
            }),
            path: None,
        }
    }

    /// Appends a record, assigning the next sequence number and timestamp.
    ///
    /// The record is durably written (fsynced) before this returns.
    pub fn append(&self, new: NewAuditRecord) -> Result<AuditRecord> {
        let mut inner = self.inner.lock().expect("audit log lock poisoned");

        let record = AuditRecord {
            seq: inner.next_seq,
            ts: Utc::now(),
            delivery_id: new.delivery_id,
            event: new.event,
            pr_number: new.pr_number,
            before: new.before,
            after: new.after,
            detail: new.detail,
        };

        if let Some(file) = inner.file.as_mut() {
            let json = serde_json::to_string(&record)?;
            writeln!(file, "{}", json)?;
            file.sync_all()?;
        }

        inner.next_seq += 1;
        inner.records.push(record.clone());
        Ok(record)
    }

    /// All records for the given PR, in sequence order.
    pub fn for_pr(&self, number: PrNumber) -> Vec<AuditRecord> {
        self.inner
            .lock()
            .expect("audit log lock poisoned")
            .records
            .iter()
            .filter(|r| r.pr_number == Some(number))
            .cloned()
            .collect()
    }

    /// The most recent `limit` records, in sequence order.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let inner = self.inner.lock().expect("audit log lock poisoned");
        let start = inner.records.len().saturating_sub(limit);
        inner.records[start..].to_vec()
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("audit log lock poisoned")
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next sequence number that will be assigned.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().expect("audit log lock poisoned").next_seq
    }

    /// Path of the durable log file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Replays a log file.
///
/// Returns `(records, valid_len, file_len)`: the parsed records, the byte
/// length of the valid prefix, and the file's total length. A line that does
/// not parse (torn write) ends the valid prefix.
fn replay(path: &Path) -> Result<(Vec<AuditRecord>, u64, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0, 0));
    }

    let content = fs::read(path)?;
    let file_len = content.len() as u64;

    let mut records = Vec::new();
    let mut valid_len = 0u64;
    for line in content.split_inclusive(|b| *b == b'\n') {
        let Some(body) = line.strip_suffix(b"\n") else {
            // No trailing newline: a write was interrupted.
            break;
        };
        match serde_json::from_slice::<AuditRecord>(body) {
            Ok(record) => {
                records.push(record);
                valid_len += line.len() as u64;
            }
            Err(_) => break,
        }
    }

    Ok((records, valid_len, file_len))
}
