//! Queue counts and tracing setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub retry_scheduled: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Tasks not yet acked (dead letters included).
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.retry_scheduled + self.dead
    }
}

/// Initialize tracing for the process.
///
/// Filter comes from `RUST_LOG` (default `info`). Safe to call multiple times;
/// later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_counts_every_queue() {
        let counts = QueueCounts {
            pending: 1,
            processing: 2,
            retry_scheduled: 3,
            dead: 4,
        };
        assert_eq!(counts.total(), 10);
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing(false);
        init_tracing(true);
    }
}
