//! Which queue owns a task.

use serde::{Deserialize, Serialize};

/// Task location in the store.
///
/// State transitions:
/// - Pending -> Processing -> (acked: removed from every queue)
/// - Pending -> Processing -> RetryScheduled -> Pending (loop until max_attempts)
/// - Pending -> Processing -> DeadLettered
/// - Processing -> Pending (recovery, once the claim has expired)
/// - DeadLettered -> Pending (operator replay)
///
/// A task is in exactly one of these at any time. The stores enforce the
/// transitions; `InMemoryTaskStore::location` reports the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    RetryScheduled,
    DeadLettered,
}

#[cfg(test)]
mod tests {
    use super::TaskState;

    #[test]
    fn serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskState::RetryScheduled).unwrap(),
            "\"retry_scheduled\""
        );
        let back: TaskState = serde_json::from_str("\"dead_lettered\"").unwrap();
        assert_eq!(back, TaskState::DeadLettered);
    }
}
