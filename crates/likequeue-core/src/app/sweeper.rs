//! RequeueSweeper - retry 待ちのタスクを期限が来たら pending に戻す
//!
//! # フロー
//! 1. 一定間隔（既定 100ms）で `sweep_due_retries(now)` を呼ぶ
//! 2. release time <= now のタスクを一件ずつアトミックに retry → pending へ移動
//! 3. 一件の失敗は warn ログだけ残し、次の tick で再試行される
//!
//! 既に移動済みのタスクを再度 sweep しても何も起きない（冪等）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::shutdown;
use crate::ports::{Clock, StoreError, SweepReport, TaskStore};

pub struct RequeueSweeper {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl RequeueSweeper {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// One sweep at the clock's current time.
    pub async fn tick(&self) -> Result<SweepReport, StoreError> {
        self.store.sweep_due_retries(self.clock.now()).await
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = interval.as_millis() as u64, "requeue sweeper started");
        while !shutdown::is_requested(&shutdown_rx) {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.tick().await {
                Ok(report) => {
                    if report.moved > 0 {
                        debug!(moved = report.moved, "due retries moved to pending");
                    }
                    if report.failed > 0 {
                        warn!(
                            failed = report.failed,
                            "some due retries could not be moved, will retry next tick"
                        );
                    }
                }
                Err(err) => warn!(error = %err, "retry sweep failed"),
            }
        }
        info!("requeue sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LikeAction, LikeFlag, LikePayload, TableRef, TaskEnvelope, TaskId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::SystemClock;
    use ulid::Ulid;

    fn task() -> TaskEnvelope {
        TaskEnvelope::new(
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
        )
    }

    #[tokio::test]
    async fn running_sweeper_releases_due_retries() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let t = task();
        store.enqueue_pending(&t).await.unwrap();
        let leased = store
            .pending_to_processing(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        store
            .schedule_retry(&leased, Duration::from_millis(30))
            .await
            .unwrap();

        let sweeper = Arc::new(RequeueSweeper::new(store.clone(), clock));
        let (tx, rx) = shutdown::channel();
        let handle = tokio::spawn(sweeper.run(Duration::from_millis(10), rx));

        // blocks until the sweeper pushes the task back
        let again = tokio::time::timeout(
            Duration::from_secs(2),
            store.pending_to_processing(Duration::ZERO),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(again.map(|t| t.id), Some(t.id));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn failed_release_is_retried_on_a_later_tick() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let (ok, stuck) = (task(), task());
        for t in [&ok, &stuck] {
            store.enqueue_pending(t).await.unwrap();
            let leased = store
                .pending_to_processing(Duration::from_millis(50))
                .await
                .unwrap()
                .unwrap();
            store.schedule_retry(&leased, Duration::ZERO).await.unwrap();
        }
        store.fail_release_of(stuck.id).await;

        let sweeper = RequeueSweeper::new(store.clone(), clock);
        assert_eq!(sweeper.tick().await.unwrap(), SweepReport { moved: 1, failed: 1 });
        let counts = store.counts().await.unwrap();
        assert_eq!((counts.pending, counts.retry_scheduled), (1, 1));

        // still failing: reported again, nothing lost
        assert_eq!(sweeper.tick().await.unwrap(), SweepReport { moved: 0, failed: 1 });

        store.clear_release_faults().await;
        assert_eq!(sweeper.tick().await.unwrap(), SweepReport { moved: 1, failed: 0 });
        let counts = store.counts().await.unwrap();
        assert_eq!((counts.pending, counts.retry_scheduled), (2, 0));
    }
}
