//! RecordStore port - like カウンタを持つ外部テーブル
//!
//! core が使うのは fetch と update だけ。ステータスコードなどの詳細は解釈せず、
//! NotFound かそれ以外の失敗かだけを区別する。

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::TableRef;

/// Field name -> value, as returned by the remote table.
pub type RecordFields = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("record {record_id} not found in {table}")]
    NotFound { table: String, record_id: String },

    #[error("remote request failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch_record(
        &self,
        table: &TableRef,
        record_id: &str,
    ) -> Result<RecordFields, RemoteError>;

    /// Overwrite the given fields; fields not present are left untouched.
    async fn update_record(
        &self,
        table: &TableRef,
        record_id: &str,
        fields: RecordFields,
    ) -> Result<(), RemoteError>;
}

/// Read a counter field as a float.
///
/// Missing, null or non-numeric fields count as 0. Numeric strings are
/// accepted since some tables hand counters back as text.
pub fn read_counter(fields: &RecordFields, name: &str) -> f64 {
    match fields.get(name) {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}
