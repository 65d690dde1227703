//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 単一プロセス用の task store + ledger
//! - **InMemoryRecordStore**: 外部テーブルの代わり（障害注入つき）
//! - **RedisTaskStore**: 共有 KV store 版（`redis` feature）

pub mod inmem_records;
pub mod inmem_store;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use self::inmem_records::{InMemoryRecordStore, RecordedUpdate};
pub use self::inmem_store::InMemoryTaskStore;
#[cfg(feature = "redis")]
pub use self::redis_store::RedisTaskStore;
