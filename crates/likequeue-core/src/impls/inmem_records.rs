//! InMemoryRecordStore - 外部テーブルの代わり（開発・テスト用）
//!
//! 失敗注入ができる:
//! - `fail_next_updates(n)`: 次の n 回の update を失敗させる
//! - `set_always_fail_updates(true)`: update を常に失敗させる
//! - `set_fail_fetches(true)`: fetch を常に失敗させる

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::TableRef;
use crate::ports::{RecordFields, RecordStore, RemoteError};

/// One successful `update_record` call, as seen by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpdate {
    pub table: TableRef,
    pub record_id: String,
    pub fields: RecordFields,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<(TableRef, String), RecordFields>>,
    updates: Mutex<Vec<RecordedUpdate>>,
    remaining_update_failures: AtomicU32,
    always_fail_updates: AtomicBool,
    fail_fetches: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, table: &TableRef, record_id: impl Into<String>, fields: RecordFields) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((table.clone(), record_id.into()), fields);
    }

    pub fn get(&self, table: &TableRef, record_id: &str) -> Option<RecordFields> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(table.clone(), record_id.to_string()))
            .cloned()
    }

    /// Successful updates in call order.
    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fail_next_updates(&self, n: u32) {
        self.remaining_update_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_always_fail_updates(&self, fail: bool) {
        self.always_fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    fn should_fail_update(&self) -> bool {
        if self.always_fail_updates.load(Ordering::SeqCst) {
            return true;
        }
        self.remaining_update_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn fetch_record(
        &self,
        table: &TableRef,
        record_id: &str,
    ) -> Result<RecordFields, RemoteError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(RemoteError::Failed("injected fetch failure".into()));
        }
        self.get(table, record_id)
            .ok_or_else(|| RemoteError::NotFound {
                table: table.to_string(),
                record_id: record_id.to_string(),
            })
    }

    async fn update_record(
        &self,
        table: &TableRef,
        record_id: &str,
        fields: RecordFields,
    ) -> Result<(), RemoteError> {
        if self.should_fail_update() {
            return Err(RemoteError::Failed("injected update failure".into()));
        }

        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(existing) = records.get_mut(&(table.clone(), record_id.to_string())) else {
                return Err(RemoteError::NotFound {
                    table: table.to_string(),
                    record_id: record_id.to_string(),
                });
            };
            existing.extend(fields.clone());
        }

        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedUpdate {
                table: table.clone(),
                record_id: record_id.to_string(),
                fields,
            });
        Ok(())
    }
}
