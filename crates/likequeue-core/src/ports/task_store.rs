//! TaskStore port - pending / processing / retry / dead-letter の四つのキュー
//!
//! # 設計原則
//! - タスク本体は id をキーにした map に置き、キューは id だけを持つ
//! - キュー間の移動は一つのアトミック操作（同時に二つのキューに見えない、途中で消えない）
//! - ack は id で行う（シリアライズ済みバイト列の一致ではない）
//! - processing への移動は claim（期限つき）。期限が切れた claim だけが回収される
//!
//! # 実装
//! - `InMemoryTaskStore`: 開発・テスト用
//! - `RedisTaskStore`: feature `redis`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::domain::{TaskEnvelope, TaskId};
use crate::observability::QueueCounts;

/// How long a dequeued task stays claimed before recovery may take it back.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The body could not be decoded; the id has been moved to the dead-letter list.
    #[error("malformed task {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("task {0} is not in processing")]
    NotProcessing(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Tasks moved from retry to pending.
    pub moved: usize,
    /// Tasks whose move failed this tick; they stay due and are picked up again.
    pub failed: usize,
}

/// A quarantined task.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub reason: String,
    /// `None` when the stored body could not be decoded.
    pub task: Option<TaskEnvelope>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Append to the tail of pending. Never blocks.
    async fn enqueue_pending(&self, task: &TaskEnvelope) -> Result<(), StoreError>;

    /// Atomically move the oldest pending task into processing and return it.
    /// The caller holds a claim on it until `clock.now + claim_ttl`.
    ///
    /// Waits up to `timeout` for a task; `Duration::ZERO` waits indefinitely.
    async fn pending_to_processing(
        &self,
        timeout: Duration,
    ) -> Result<Option<TaskEnvelope>, StoreError>;

    /// Whether the task is still in processing under an unexpired claim.
    ///
    /// `false` means another consumer may already have recovered it, so the
    /// caller must not write anything on its behalf.
    async fn still_claimed(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Remove the task from processing and drop its body.
    async fn ack(&self, id: TaskId) -> Result<AckOutcome, StoreError>;

    /// Atomically move the task from processing into the retry set, storing
    /// its updated body. Release time is `clock.now + delay`.
    async fn schedule_retry(&self, task: &TaskEnvelope, delay: Duration)
    -> Result<(), StoreError>;

    /// Atomically move the task from processing into the dead-letter list.
    async fn move_to_dead_letter(&self, task: &TaskEnvelope, reason: &str)
    -> Result<(), StoreError>;

    /// Move every retry entry with release time <= `now` back to pending.
    ///
    /// Each task moves in its own atomic step; a failure on one task does not
    /// stop the others.
    async fn sweep_due_retries(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError>;

    /// Move tasks whose claim has expired back to pending. Tasks still
    /// claimed by a live consumer stay where they are.
    async fn recover_processing(&self) -> Result<usize, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Oldest dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;

    /// Replay a dead-lettered task: attempts reset to 0, back to pending.
    /// Returns `false` if the id is not in the dead-letter list.
    async fn requeue_dead(&self, id: TaskId) -> Result<bool, StoreError>;
}
