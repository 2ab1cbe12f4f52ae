//! In-memory ledger (non-persistent).

use super::{Ledger, LedgerEntry, LedgerError, NewEntry};
use crate::task::TaskId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

pub struct InMemoryLedger {
    entries: RwLock<Vec<LedgerEntry>>,
    available: AtomicBool,
    /// Appends left before the store goes away; `None` means no limit.
    append_budget: Mutex<Option<usize>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
            append_budget: Mutex::new(None),
        }
    }

    /// Simulate the backing store going away (or coming back).
    ///
    /// While unavailable every call fails with `StoreUnavailable`, which lets
    /// callers exercise their not-yet-committed paths.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Let `appends` more appends through, then become unavailable.
    pub fn fail_after_appends(&self, appends: usize) {
        *self.append_budget.lock().unwrap_or_else(|p| p.into_inner()) = Some(appends);
    }

    fn spend_append(&self) {
        let mut budget = self.append_budget.lock().unwrap_or_else(|p| p.into_inner());
        match budget.as_mut() {
            Some(0) => {
                *budget = None;
                self.available.store(false, Ordering::SeqCst);
            }
            Some(left) => *left -= 1,
            None => {}
        }
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::StoreUnavailable(
                "in-memory ledger marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn append(&self, entry: NewEntry) -> Result<u64, LedgerError> {
        self.spend_append();
        self.check_available()?;
        // Sequence is assigned under the write lock, so concurrent appends
        // cannot interleave.
        let mut entries = self.entries.write().await;
        let sequence = entries.len() as u64 + 1;
        entries.push(entry.seal(sequence));
        Ok(sequence)
    }

    async fn read_since(&self, sequence: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.check_available()?;
        let entries = self.entries.read().await;
        let start = (sequence as usize).min(entries.len());
        Ok(entries[start..].to_vec())
    }

    async fn latest_for(&self, task_id: TaskId) -> Result<Option<LedgerEntry>, LedgerError> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().find(|e| e.task_id == task_id).cloned())
    }

    async fn head(&self) -> Result<u64, LedgerError> {
        self.check_available()?;
        Ok(self.entries.read().await.len() as u64)
    }
}
