use thiserror::Error;

use crate::codec::CodecError;
use crate::ports::StoreError;

/// Errors visible to whoever enqueues a like/unlike request.
///
/// Everything that goes wrong after the task is in the queue is handled by the
/// dispatcher (retry, dead-letter or log) and never reaches the caller.
#[derive(Debug, Error)]
pub enum LikeQueueError {
    #[error("serialization error: {0}")]
    Serialization(#[source] CodecError),

    #[error("queue error: {0}")]
    Queue(#[source] StoreError),
}

impl From<StoreError> for LikeQueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Codec(e) => LikeQueueError::Serialization(e),
            other => LikeQueueError::Queue(other),
        }
    }
}

impl From<CodecError> for LikeQueueError {
    fn from(err: CodecError) -> Self {
        LikeQueueError::Serialization(err)
    }
}
