//! Per-record leases.
//!
//! The dispatcher reads the remote counters, adds the delta and writes them
//! back. Two tasks for the same record doing that at once would lose an
//! update, so each task holds the record's lease from fetch until it has been
//! acked, rescheduled or dead-lettered. Tasks for different records still run
//! in parallel across dispatcher workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::TableRef;

#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a record is being mutated; released on drop.
pub struct RecordLease {
    _guard: OwnedMutexGuard<()>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, table: &TableRef, record_id: &str) -> RecordLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(format!("{table}/{record_id}"))
                .or_default()
                .clone()
        };
        RecordLease {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of records with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_record_is_serialized() {
        let locks = Arc::new(RecordLocks::new());
        let table = TableRef::new("app", "tbl");

        let first = locks.acquire(&table, "rec1").await;
        let second = tokio::spawn({
            let locks = locks.clone();
            let table = table.clone();
            async move {
                let _lease = locks.acquire(&table, "rec1").await;
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_records_do_not_block() {
        let locks = RecordLocks::new();
        let table = TableRef::new("app", "tbl");

        let _a = locks.acquire(&table, "rec1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&table, "rec2"))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = RecordLocks::new();
        let table = TableRef::new("app", "tbl");

        drop(locks.acquire(&table, "rec1").await);
        drop(locks.acquire(&table, "rec2").await);
        let _c = locks.acquire(&table, "rec3").await;
        assert_eq!(locks.tracked(), 1);
    }
}
