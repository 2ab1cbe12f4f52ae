//! Append-only execution ledger with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: JSON-lines file, fsync per append, exclusive process lock
//! - `sqlite`: SQLite database, one transaction per append
//!
//! Every backend hands out gap-free, strictly increasing sequence numbers
//! starting at 1. The sequence number is the only ordering authority;
//! timestamps are informational. A successful `append` means the entry is
//! durable for that backend.

mod file;
mod memory;
mod sqlite;

pub use file::FileLedger;
pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::task::TaskId;

/// Kind of state change recorded by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEventKind {
    Submitted,
    Started,
    Completed,
    Failed,
    Delegated,
    Cancelled,
}

impl LedgerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Delegated => "DELEGATED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(Self::Submitted),
            "STARTED" => Some(Self::Started),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "DELEGATED" => Some(Self::Delegated),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this kind closes a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for LedgerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional cost/latency metadata attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cents: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Immutable record of one state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub task_id: TaskId,
    pub kind: LedgerEventKind,
    pub timestamp: DateTime<Utc>,
    /// Agent id that caused the event.
    pub actor: String,
    /// SHA-256 of the payload or result this entry describes.
    pub digest: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<EntryMetrics>,
}

/// An entry before the ledger has assigned it a sequence number.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub task_id: TaskId,
    pub kind: LedgerEventKind,
    pub actor: String,
    pub digest: String,
    pub summary: String,
    pub metrics: Option<EntryMetrics>,
}

/// Maximum summary length kept in the ledger.
const MAX_SUMMARY_CHARS: usize = 500;

impl NewEntry {
    pub fn new(task_id: TaskId, kind: LedgerEventKind, actor: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            actor: actor.into(),
            digest: crate::util::digest_json(&serde_json::Value::Null),
            summary: String::new(),
            metrics: None,
        }
    }

    /// Digest `value` and keep a truncated rendering of it as the summary.
    pub fn with_payload(mut self, value: &serde_json::Value) -> Self {
        self.digest = crate::util::digest_json(value);
        if self.summary.is_empty() {
            self.summary = crate::util::truncate(&value.to_string(), MAX_SUMMARY_CHARS);
        }
        self
    }

    pub fn with_summary(mut self, summary: impl AsRef<str>) -> Self {
        self.summary = crate::util::truncate(summary.as_ref(), MAX_SUMMARY_CHARS);
        self
    }

    pub fn with_metrics(mut self, metrics: EntryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Stamp the entry with its sequence number and the current time.
    pub(crate) fn seal(self, sequence: u64) -> LedgerEntry {
        LedgerEntry {
            sequence,
            task_id: self.task_id,
            kind: self.kind,
            timestamp: Utc::now(),
            actor: self.actor,
            digest: self.digest,
            summary: self.summary,
            metrics: self.metrics,
        }
    }
}

/// Errors that can occur in ledger operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ledger data is corrupt: {0}")]
    Corrupt(String),
}

/// Ledger trait - implemented by all storage backends.
///
/// Appends must be mutually exclusive across concurrent writers; each backend
/// serializes them internally so callers never coordinate.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether this ledger persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Durably append an entry and return its sequence number.
    async fn append(&self, entry: NewEntry) -> Result<u64, LedgerError>;

    /// Entries with a sequence number strictly greater than `sequence`, in order.
    /// `read_since(0)` returns the whole ledger.
    async fn read_since(&self, sequence: u64) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Most recent entry for a task.
    async fn latest_for(&self, task_id: TaskId) -> Result<Option<LedgerEntry>, LedgerError>;

    /// All entries for a task, in sequence order.
    async fn entries_for(&self, task_id: TaskId) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .read_since(0)
            .await?
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect())
    }

    /// Highest sequence number written so far (0 for an empty ledger).
    async fn head(&self) -> Result<u64, LedgerError> {
        Ok(self
            .read_since(0)
            .await?
            .last()
            .map(|e| e.sequence)
            .unwrap_or(0))
    }
}

/// Shared ledger type.
pub type SharedLedger = Arc<dyn Ledger>;

/// Ledger backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerBackend {
    Memory,
    File,
    #[default]
    Sqlite,
}

impl LedgerBackend {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "file" | "jsonl" => Some(Self::File),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Create a ledger based on backend type and data directory.
pub async fn create_ledger(
    backend: LedgerBackend,
    base_dir: PathBuf,
) -> Result<SharedLedger, LedgerError> {
    match backend {
        LedgerBackend::Memory => Ok(Arc::new(InMemoryLedger::new())),
        LedgerBackend::File => {
            let ledger = FileLedger::open(base_dir.join("ledger.jsonl")).await?;
            Ok(Arc::new(ledger))
        }
        LedgerBackend::Sqlite => {
            let ledger = SqliteLedger::open(base_dir.join("ledger.db")).await?;
            Ok(Arc::new(ledger))
        }
    }
}

/// Check that `entries` are numbered 1..=n without gaps.
pub(crate) fn verify_contiguous(entries: &[LedgerEntry]) -> Result<(), LedgerError> {
    for (idx, entry) in entries.iter().enumerate() {
        let expected = idx as u64 + 1;
        if entry.sequence != expected {
            return Err(LedgerError::Corrupt(format!(
                "expected sequence {} but found {}",
                expected, entry.sequence
            )));
        }
    }
    Ok(())
}
