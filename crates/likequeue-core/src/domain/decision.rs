//! Decision model: what to do with a task whose processing failed.
//!
//! This module defines the Decision type (retry or dead-letter) and the Decider
//! trait (how to pick one based on the task's attempt counter).

use std::time::Duration;

use super::envelope::TaskEnvelope;
use crate::app::retry::RetryPolicy;

/// The next action to take for a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task in the retry set for `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up and quarantine the task.
    DeadLetter { reason: String },
}

/// Trait for deciding what happens after a failed attempt.
///
/// Deciders are pure functions: they look at the task (whose `attempts` has
/// already been incremented for the failure) and return the next action.
/// Writing the decision to the store is the dispatcher's job.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskEnvelope, error: &str) -> Decision;
}

/// Attempt-based decider:
/// - Retry if attempts < max_attempts, delayed by the RetryPolicy
/// - Dead-letter if attempts >= max_attempts
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskEnvelope, error: &str) -> Decision {
        if task.is_exhausted() {
            Decision::DeadLetter {
                reason: format!(
                    "max attempts reached ({}/{}): {error}",
                    task.attempts, task.max_attempts
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(task.attempts);
            Decision::Retry {
                delay,
                reason: format!(
                    "attempt {}/{} failed, retrying in {:?}: {error}",
                    task.attempts, task.max_attempts, delay
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::TaskId;
    use crate::domain::like::{LikeAction, LikeFlag, LikePayload, TableRef};
    use ulid::Ulid;

    fn task_with_attempts(attempts: u32) -> TaskEnvelope {
        let mut task = TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            0,
            5,
            LikePayload {
                table: TableRef::new("app", "tbl"),
                record_id: "rec1".into(),
                user_id: "u1".into(),
                like_flag: LikeFlag::Resolved,
                action: LikeAction::Add,
            },
        );
        task.attempts = attempts;
        task
    }

    #[test]
    fn retries_below_the_ceiling() {
        let decider = DefaultDecider::default();
        let decision = decider.decide(&task_with_attempts(3), "boom");

        match decision {
            Decision::Retry { delay, reason } => {
                assert_eq!(delay, Duration::from_secs(8));
                assert!(reason.contains("3/5"));
                assert!(reason.contains("boom"));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn dead_letters_at_the_ceiling() {
        let decider = DefaultDecider::default();
        let decision = decider.decide(&task_with_attempts(5), "boom");

        assert!(matches!(decision, Decision::DeadLetter { reason } if reason.contains("5/5")));
    }
}
