//! TaskEnvelope - キューを流れる like/unlike タスクの単位
//!
//! payload は作成後に変更されない。変更されるのは `attempts` だけで、
//! それも dispatcher が失敗を記録するときに限られる。

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::like::LikePayload;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: LikePayload,
}

impl TaskEnvelope {
    pub fn new(id: TaskId, created_at: i64, max_attempts: u32, payload: LikePayload) -> Self {
        Self {
            id,
            created_at,
            attempts: 0,
            max_attempts,
            payload,
        }
    }

    /// Record one failed processing attempt and return the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
