//! SQLite-backed ledger.

use super::{EntryMetrics, Ledger, LedgerEntry, LedgerError, LedgerEventKind, NewEntry};
use crate::task::TaskId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS ledger_entries (
    sequence INTEGER PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    actor TEXT NOT NULL,
    digest TEXT NOT NULL,
    summary TEXT NOT NULL,
    metrics TEXT
);

CREATE INDEX IF NOT EXISTS idx_ledger_task ON ledger_entries(task_id, sequence);

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are append-only');
END;
"#;

const SELECT_COLUMNS: &str =
    "SELECT sequence, task_id, kind, timestamp, actor, digest, summary, metrics FROM ledger_entries";

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

fn unavailable(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::StoreUnavailable(e.to_string())
}

impl SqliteLedger {
    pub async fn open(db_path: PathBuf) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(format!("Failed to create ledger dir: {}", e)))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| unavailable(format!("Failed to open SQLite database: {}", e)))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| unavailable(format!("Failed to run schema: {}", e)))?;
            Ok::<_, LedgerError>(conn)
        })
        .await
        .map_err(|e| unavailable(format!("Task join error: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-process database that vanishes with the connection.
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_row(row: &rusqlite::Row<'_>) -> Result<LedgerEntry, rusqlite::Error> {
    let sequence: i64 = row.get(0)?;
    let task_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let timestamp: String = row.get(3)?;
    let metrics: Option<String> = row.get(7)?;

    let conversion = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(LedgerError::Corrupt(msg)),
        )
    };

    Ok(LedgerEntry {
        sequence: sequence as u64,
        task_id: task_id
            .parse::<TaskId>()
            .map_err(|e| conversion(1, format!("bad task id {}: {}", task_id, e)))?,
        kind: LedgerEventKind::parse(&kind)
            .ok_or_else(|| conversion(2, format!("unknown event kind {}", kind)))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion(3, format!("bad timestamp {}: {}", timestamp, e)))?,
        actor: row.get(4)?,
        digest: row.get(5)?,
        summary: row.get(6)?,
        metrics: metrics
            .map(|m| {
                serde_json::from_str::<EntryMetrics>(&m)
                    .map_err(|e| conversion(7, format!("bad metrics {}: {}", m, e)))
            })
            .transpose()?,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn append(&self, entry: NewEntry) -> Result<u64, LedgerError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;

            let sequence: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) + 1 FROM ledger_entries",
                    [],
                    |row| row.get(0),
                )
                .map_err(unavailable)?;

            let sealed = entry.seal(sequence as u64);
            let metrics = sealed
                .metrics
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| LedgerError::Corrupt(format!("cannot encode metrics: {}", e)))?;

            tx.execute(
                "INSERT INTO ledger_entries
                 (sequence, task_id, kind, timestamp, actor, digest, summary, metrics)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    sequence,
                    sealed.task_id.to_string(),
                    sealed.kind.as_str(),
                    sealed.timestamp.to_rfc3339(),
                    sealed.actor,
                    sealed.digest,
                    sealed.summary,
                    metrics,
                ],
            )
            .map_err(unavailable)?;

            tx.commit().map_err(unavailable)?;
            Ok(sequence as u64)
        })
        .await
        .map_err(|e| unavailable(format!("Task join error: {}", e)))?
    }

    async fn read_since(&self, sequence: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE sequence > ?1 ORDER BY sequence ASC",
                    SELECT_COLUMNS
                ))
                .map_err(unavailable)?;
            let rows = stmt
                .query_map(params![sequence as i64], parse_row)
                .map_err(unavailable)?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row.map_err(|e| LedgerError::Corrupt(e.to_string()))?);
            }
            Ok(result)
        })
        .await
        .map_err(|e| unavailable(format!("Task join error: {}", e)))?
    }

    async fn latest_for(&self, task_id: TaskId) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                &format!(
                    "{} WHERE task_id = ?1 ORDER BY sequence DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![task_id.to_string()],
                parse_row,
            )
            .optional()
            .map_err(|e| LedgerError::Corrupt(e.to_string()))
        })
        .await
        .map_err(|e| unavailable(format!("Task join error: {}", e)))?
    }

    async fn entries_for(&self, task_id: TaskId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE task_id = ?1 ORDER BY sequence ASC",
                    SELECT_COLUMNS
                ))
                .map_err(unavailable)?;
            let rows = stmt
                .query_map(params![task_id.to_string()], parse_row)
                .map_err(unavailable)?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row.map_err(|e| LedgerError::Corrupt(e.to_string()))?);
            }
            Ok(result)
        })
        .await
        .map_err(|e| unavailable(format!("Task join error: {}", e)))?
    }

    async fn head(&self) -> Result<u64, LedgerError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let head: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) FROM ledger_entries",
                    [],
                    |row| row.get(0),
                )
                .map_err(unavailable)?;
            Ok(head as u64)
        })
        .await
        .map_err(|e| unavailable(format!("Task join error: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteLedger::open(dir.path().join("ledger.db")).await.unwrap();
        crate::ledger::tests::exercise_backend(&ledger).await;
    }

    #[tokio::test]
    async fn test_in_memory_conformance() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        crate::ledger::tests::exercise_backend(&ledger).await;
    }

    #[tokio::test]
    async fn test_entries_cannot_be_rewritten() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        ledger
            .append(NewEntry::new(TaskId::new(), LedgerEventKind::Submitted, "kernel"))
            .await
            .unwrap();

        let conn = ledger.conn.lock().await;
        assert!(conn
            .execute("UPDATE ledger_entries SET actor = 'mallory'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM ledger_entries", []).is_err());
    }

    #[tokio::test]
    async fn test_unreadable_metrics_are_reported() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        {
            let conn = ledger.conn.lock().await;
            conn.execute(
                "INSERT INTO ledger_entries
                 (sequence, task_id, kind, timestamp, actor, digest, summary, metrics)
                 VALUES (1, ?1, 'COMPLETED', ?2, 'kernel', '', '', '{not json')",
                params![TaskId::new().to_string(), Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let err = ledger.read_since(0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt(ref msg) if msg.contains("bad metrics")));
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let ledger = SqliteLedger::open(path.clone()).await.unwrap();
            for _ in 0..3 {
                ledger
                    .append(NewEntry::new(TaskId::new(), LedgerEventKind::Submitted, "kernel"))
                    .await
                    .unwrap();
            }
        }
        let ledger = SqliteLedger::open(path).await.unwrap();
        assert_eq!(ledger.head().await.unwrap(), 3);
        let seq = ledger
            .append(NewEntry::new(TaskId::new(), LedgerEventKind::Submitted, "kernel"))
            .await
            .unwrap();
        assert_eq!(seq, 4);
    }
}
