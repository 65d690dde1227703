//! Producer - like/unlike リクエストをタスクにして pending に積む
//!
//! record や user の存在チェックはしない。検証は処理時に remote の実レコードに対して行う。

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::domain::{LikeAction, LikeFlag, LikePayload, TableRef, TaskEnvelope, TaskId};
use crate::error::LikeQueueError;
use crate::ports::{Clock, IdGenerator, TaskStore};

#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Producer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            ids,
            clock,
            max_attempts,
        }
    }

    pub async fn enqueue_like(
        &self,
        app_token: &str,
        table_id: &str,
        record_id: &str,
        user_id: &str,
        like_flag: LikeFlag,
        action: LikeAction,
    ) -> Result<TaskId, LikeQueueError> {
        self.enqueue(LikePayload {
            table: TableRef::new(app_token, table_id),
            record_id: record_id.to_string(),
            user_id: user_id.to_string(),
            like_flag,
            action,
        })
        .await
    }

    #[instrument(
        skip(self, payload),
        fields(record_id = %payload.record_id, user_id = %payload.user_id),
        err
    )]
    pub async fn enqueue(&self, payload: LikePayload) -> Result<TaskId, LikeQueueError> {
        let task = TaskEnvelope::new(
            self.ids.generate_task_id(),
            self.clock.now_millis(),
            self.max_attempts,
            payload,
        );
        self.store.enqueue_pending(&task).await?;

        debug!(
            task_id = %task.id,
            action = %task.payload.action,
            like_flag = %task.payload.like_flag,
            "like task enqueued"
        );
        Ok(task.id)
    }
}
