//! JSON-lines ledger file.
//!
//! One entry per line, flushed with `fsync` before `append` returns. The file
//! is opened with an exclusive advisory lock so a second process cannot
//! interleave sequence numbers.

use super::{verify_contiguous, Ledger, LedgerEntry, LedgerError, NewEntry};
use crate::task::TaskId;
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

struct FileState {
    file: File,
    entries: Vec<LedgerEntry>,
}

pub struct FileLedger {
    path: PathBuf,
    state: Arc<Mutex<FileState>>,
}

impl FileLedger {
    pub async fn open(path: PathBuf) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LedgerError::StoreUnavailable(format!("Failed to create ledger dir: {}", e))
            })?;
        }

        let open_path = path.clone();
        let state = tokio::task::spawn_blocking(move || Self::load(open_path))
            .await
            .map_err(|e| LedgerError::StoreUnavailable(format!("Task join error: {}", e)))??;

        tracing::debug!(
            path = %path.display(),
            entries = state.entries.len(),
            "Opened file ledger"
        );

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load(path: PathBuf) -> Result<FileState, LedgerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::StoreUnavailable(format!("Failed to open ledger: {}", e)))?;

        file.try_lock_exclusive().map_err(|e| {
            LedgerError::StoreUnavailable(format!(
                "Ledger {} is locked by another process: {}",
                path.display(),
                e
            ))
        })?;

        file.seek(SeekFrom::Start(0))
            .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?;

        let mut entries = Vec::new();
        let mut valid_len: u64 = 0;
        let mut torn_tail = false;
        let reader = BufReader::new(&file);
        let lines: Vec<String> = reader
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| LedgerError::StoreUnavailable(format!("Failed to read ledger: {}", e)))?;
        let line_count = lines.len();

        for (idx, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                valid_len += line.len() as u64 + 1;
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => {
                    entries.push(entry);
                    valid_len += line.len() as u64 + 1;
                }
                // A crash mid-append can leave a partial final line; it was
                // never acknowledged, so dropping it is safe.
                Err(e) if idx + 1 == line_count => {
                    tracing::warn!(
                        path = %path.display(),
                        "Discarding torn ledger tail: {}",
                        e
                    );
                    torn_tail = true;
                }
                Err(e) => {
                    return Err(LedgerError::Corrupt(format!(
                        "line {} of {}: {}",
                        idx + 1,
                        path.display(),
                        e
                    )));
                }
            }
        }

        if torn_tail {
            file.set_len(valid_len)
                .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?;
        }

        verify_contiguous(&entries)?;
        Ok(FileState { file, entries })
    }
}

#[async_trait]
impl Ledger for FileLedger {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn append(&self, entry: NewEntry) -> Result<u64, LedgerError> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = state.blocking_lock();
            let sequence = state.entries.len() as u64 + 1;
            let sealed = entry.seal(sequence);
            let mut line = serde_json::to_string(&sealed)
                .map_err(|e| LedgerError::StoreUnavailable(format!("Failed to encode entry: {}", e)))?;
            line.push('\n');

            let before = state
                .file
                .metadata()
                .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?
                .len();
            let written = match state.file.write_all(line.as_bytes()) {
                Ok(()) => state.file.sync_data(),
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                // Roll back a partial write so the file never holds an
                // unacknowledged entry.
                let _ = state.file.set_len(before);
                return Err(LedgerError::StoreUnavailable(format!(
                    "Failed to append ledger entry: {}",
                    e
                )));
            }

            state.entries.push(sealed);
            Ok(sequence)
        })
        .await
        .map_err(|e| LedgerError::StoreUnavailable(format!("Task join error: {}", e)))?
    }

    async fn read_since(&self, sequence: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.state.lock().await;
        let start = (sequence as usize).min(state.entries.len());
        Ok(state.entries[start..].to_vec())
    }

    async fn latest_for(&self, task_id: TaskId) -> Result<Option<LedgerEntry>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.entries.iter().rev().find(|e| e.task_id == task_id).cloned())
    }

    async fn head(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().await.entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerEventKind;

    #[tokio::test]
    async fn test_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::open(dir.path().join("ledger.jsonl")).await.unwrap();
        crate::ledger::tests::exercise_backend(&ledger).await;
    }

    #[tokio::test]
    async fn test_reopen_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let task = TaskId::new();
        {
            let ledger = FileLedger::open(path.clone()).await.unwrap();
            ledger
                .append(NewEntry::new(task, LedgerEventKind::Submitted, "kernel"))
                .await
                .unwrap();
            ledger
                .append(NewEntry::new(task, LedgerEventKind::Started, "operator"))
                .await
                .unwrap();
        }
        let ledger = FileLedger::open(path).await.unwrap();
        assert_eq!(ledger.head().await.unwrap(), 2);
        let seq = ledger
            .append(NewEntry::new(task, LedgerEventKind::Completed, "operator"))
            .await
            .unwrap();
        assert_eq!(seq, 3);
    }

    #[tokio::test]
    async fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = FileLedger::open(path.clone()).await.unwrap();
            ledger
                .append(NewEntry::new(TaskId::new(), LedgerEventKind::Submitted, "kernel"))
                .await
                .unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"sequence\":2,\"task_").unwrap();
        }
        let ledger = FileLedger::open(path).await.unwrap();
        assert_eq!(ledger.head().await.unwrap(), 1);
        let seq = ledger
            .append(NewEntry::new(TaskId::new(), LedgerEventKind::Submitted, "kernel"))
            .await
            .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(ledger.read_since(0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "not json\n{}\n").unwrap();
        let err = FileLedger::open(path).await.err().unwrap();
        assert!(matches!(err, LedgerError::Corrupt(_)));
    }
}
