//! Dispatcher - pending からタスクを一件ずつ取り出して like を適用するループ
//!
//! # フロー（1 タスク）
//! 1. `pending_to_processing` で取得（processing へアトミックに移動し claim を取る）
//! 2. record の lease を取る
//! 3. remote record を fetch（NotFound → dead-letter / その他の失敗 → retry policy）
//! 4. ledger から前回の状態を読む
//! 5. resolver: NoOp なら ack して終わり
//! 6. claim がまだ有効か確認（切れていれば何も書かずに手放す）
//! 7. remote のカウンタを一回の update で書き換える
//!    - 成功: ack → ledger 更新（ledger の失敗はログのみ）
//!    - 失敗: retry policy（attempts++ → retry か dead-letter）
//!
//! # 順序
//! dequeue と lease の取得は一つの gate の中で行うので、同じプロセス内では
//! 同じ record のタスクは pending の順に適用される。retry に回ったタスクは
//! 後続のタスクに追い越される。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::record_locks::{RecordLease, RecordLocks};
use super::shutdown;
use crate::config::CounterFields;
use crate::domain::{
    CounterDelta, Decider, Decision, LedgerEffect, LikeFlag, Resolution, TaskEnvelope, resolve,
};
use crate::ports::{
    AckOutcome, LikeLedger, RecordFields, RecordStore, RemoteError, StoreError, TaskStore,
    read_counter,
};

/// How a single task ended up after one pass through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Remote counters updated and task acked.
    Applied,
    /// The user already held the requested state; acked without writes.
    NoOp,
    RetryScheduled,
    DeadLettered,
    /// The claim expired before the remote write; nothing was written and the
    /// task is left to whoever recovers it.
    ClaimLost,
    /// The store rejected the final ack/retry/dead-letter write. The task is
    /// still in processing and comes back through startup recovery.
    Unsettled,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub dequeue_timeout: Duration,
    pub idle_sleep: Duration,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    ledger: Arc<dyn LikeLedger>,
    records: Arc<dyn RecordStore>,
    decider: Arc<dyn Decider>,
    locks: Arc<RecordLocks>,
    /// Serializes dequeue + lease acquisition across workers.
    dequeue_gate: Mutex<()>,
    counter_fields: CounterFields,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<dyn LikeLedger>,
        records: Arc<dyn RecordStore>,
        decider: Arc<dyn Decider>,
        counter_fields: CounterFields,
    ) -> Self {
        Self {
            store,
            ledger,
            records,
            decider,
            locks: Arc::new(RecordLocks::new()),
            dequeue_gate: Mutex::new(()),
            counter_fields,
        }
    }

    /// Dequeue and process one task. `Ok(None)` when nothing arrived within `timeout`.
    pub async fn process_next(
        &self,
        timeout: Duration,
    ) -> Result<Option<ProcessOutcome>, StoreError> {
        let (task, lease) = {
            let _gate = self.dequeue_gate.lock().await;
            let Some(task) = self.store.pending_to_processing(timeout).await? else {
                return Ok(None);
            };
            let lease = self
                .locks
                .acquire(&task.payload.table, &task.payload.record_id)
                .await;
            (task, lease)
        };
        Ok(Some(self.process_leased(task, lease).await))
    }

    /// Process a task that is already in processing.
    pub async fn process(&self, task: TaskEnvelope) -> ProcessOutcome {
        let lease = self
            .locks
            .acquire(&task.payload.table, &task.payload.record_id)
            .await;
        self.process_leased(task, lease).await
    }

    async fn process_leased(&self, task: TaskEnvelope, _lease: RecordLease) -> ProcessOutcome {
        let payload = &task.payload;

        let fetched = self
            .records
            .fetch_record(&payload.table, &payload.record_id)
            .await;
        let fields = match fetched {
            Ok(fields) => fields,
            Err(err @ RemoteError::NotFound { .. }) => {
                return self.dead_letter(&task, &err.to_string()).await;
            }
            Err(err) => return self.fail(task, &format!("fetch failed: {err}")).await,
        };

        let key = payload.ledger_key();
        let previous = match self.ledger.get(&key).await {
            Ok(previous) => previous,
            Err(err) => return self.fail(task, &format!("ledger read failed: {err}")).await,
        };

        let (delta, effect) = match resolve(payload.action, payload.like_flag, previous) {
            Resolution::NoOp => {
                debug!(
                    task_id = %task.id,
                    record_id = %payload.record_id,
                    user_id = %payload.user_id,
                    like_flag = %payload.like_flag,
                    "state already applied, nothing to do"
                );
                return self.settle_ack(&task, ProcessOutcome::NoOp).await;
            }
            Resolution::Apply { delta, ledger } => (delta, ledger),
        };

        match self.store.still_claimed(task.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    task_id = %task.id,
                    record_id = %payload.record_id,
                    "claim expired before the remote write, leaving the task to recovery"
                );
                return ProcessOutcome::ClaimLost;
            }
            Err(err) => return self.fail(task, &format!("claim check failed: {err}")).await,
        }

        let update = self.counter_update(&fields, delta);
        let updated = self
            .records
            .update_record(&payload.table, &payload.record_id, update)
            .await;
        if let Err(err) = updated {
            return self.fail(task, &format!("update failed: {err}")).await;
        }

        let outcome = self.settle_ack(&task, ProcessOutcome::Applied).await;

        // The remote write is committed at this point; a ledger failure is not rolled back.
        let written = match effect {
            LedgerEffect::Set(flag) => self.ledger.set(&key, flag).await,
            LedgerEffect::Delete => self.ledger.delete(&key).await,
        };
        if let Err(err) = written {
            warn!(
                task_id = %task.id,
                ledger_key = %key,
                error = %err,
                "remote counters updated but ledger write failed"
            );
        }

        info!(
            task_id = %task.id,
            record_id = %payload.record_id,
            user_id = %payload.user_id,
            action = %payload.action,
            like_flag = %payload.like_flag,
            resolved_delta = delta.resolved,
            unresolved_delta = delta.unresolved,
            "like applied"
        );
        outcome
    }

    /// New absolute values for the counters `delta` touches, based on the
    /// freshly fetched fields.
    fn counter_update(&self, fields: &RecordFields, delta: CounterDelta) -> RecordFields {
        [LikeFlag::Resolved, LikeFlag::Unresolved]
            .into_iter()
            .filter(|flag| delta.get(*flag) != 0)
            .map(|flag| {
                let name = self.counter_fields.field(flag);
                let value = read_counter(fields, name) + f64::from(delta.get(flag));
                (name.to_string(), serde_json::Value::from(value))
            })
            .collect()
    }

    async fn settle_ack(&self, task: &TaskEnvelope, outcome: ProcessOutcome) -> ProcessOutcome {
        match self.store.ack(task.id).await {
            Ok(AckOutcome::Acked) => outcome,
            Ok(AckOutcome::NotFound) => {
                // the claim ran out during the remote write and someone recovered the task
                error!(task_id = %task.id, "ack found no processing entry");
                outcome
            }
            Err(err) => {
                error!(task_id = %task.id, error = %err, "ack failed");
                ProcessOutcome::Unsettled
            }
        }
    }

    /// Count the failure and hand the task to the retry policy.
    async fn fail(&self, mut task: TaskEnvelope, error: &str) -> ProcessOutcome {
        task.record_failure();
        match self.decider.decide(&task, error) {
            Decision::Retry { delay, reason } => {
                match self.store.schedule_retry(&task, delay).await {
                    Ok(()) => {
                        warn!(
                            task_id = %task.id,
                            record_id = %task.payload.record_id,
                            attempts = task.attempts,
                            max_attempts = task.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            %reason,
                            "task failed, retry scheduled"
                        );
                        ProcessOutcome::RetryScheduled
                    }
                    Err(err) => {
                        error!(task_id = %task.id, error = %err, "failed to schedule retry");
                        ProcessOutcome::Unsettled
                    }
                }
            }
            Decision::DeadLetter { reason } => self.dead_letter(&task, &reason).await,
        }
    }

    async fn dead_letter(&self, task: &TaskEnvelope, reason: &str) -> ProcessOutcome {
        match self.store.move_to_dead_letter(task, reason).await {
            Ok(()) => {
                error!(
                    task_id = %task.id,
                    record_id = %task.payload.record_id,
                    attempts = task.attempts,
                    %reason,
                    "task dead-lettered"
                );
                ProcessOutcome::DeadLettered
            }
            Err(err) => {
                error!(task_id = %task.id, error = %err, "failed to dead-letter task");
                ProcessOutcome::Unsettled
            }
        }
    }

    /// Worker loop. Checks for shutdown between tasks and while idle; a task
    /// that has been dequeued is always processed to the end.
    pub async fn run(
        self: Arc<Self>,
        worker_id: usize,
        settings: DispatcherSettings,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(worker_id, "dispatcher started");
        while !shutdown::is_requested(&shutdown_rx) {
            match self.process_next(settings.dequeue_timeout).await {
                Ok(Some(outcome)) => debug!(worker_id, ?outcome, "task processed"),
                Ok(None) => {
                    if shutdown::sleep_or_shutdown(&mut shutdown_rx, settings.idle_sleep).await {
                        break;
                    }
                }
                Err(StoreError::Malformed { id, reason }) => {
                    error!(worker_id, task_id = %id, %reason, "malformed task moved to dead-letter");
                }
                Err(err) => {
                    warn!(worker_id, error = %err, "dequeue failed");
                    if shutdown::sleep_or_shutdown(&mut shutdown_rx, settings.idle_sleep).await {
                        break;
                    }
                }
            }
        }
        info!(worker_id, "dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::retry::RetryPolicy;
    use crate::app::sweeper::RequeueSweeper;
    use crate::domain::{DefaultDecider, LedgerKey, LikeAction, TableRef, TaskState};
    use crate::impls::{InMemoryRecordStore, InMemoryTaskStore};
    use crate::ports::{Clock, DEFAULT_CLAIM_TTL, FixedClock, UlidGenerator};
    use crate::app::producer::Producer;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const WAIT: Duration = Duration::from_millis(50);

    struct Harness {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryTaskStore>,
        records: Arc<InMemoryRecordStore>,
        producer: Producer,
        dispatcher: Dispatcher,
        sweeper: RequeueSweeper,
    }

    fn table() -> TableRef {
        TableRef::new("app", "tbl")
    }

    fn harness() -> Harness {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let records = Arc::new(InMemoryRecordStore::new());
        records.insert(
            &table(),
            "R1",
            [
                ("title".to_string(), json!("printer on 3F is down")),
                ("resolved_count".to_string(), json!(3)),
                ("unresolved_count".to_string(), json!(7)),
            ]
            .into_iter()
            .collect(),
        );

        let producer = Producer::new(
            store.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock.clone(),
            5,
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            store.clone(),
            records.clone(),
            Arc::new(DefaultDecider::new(RetryPolicy::default())),
            CounterFields::default(),
        );
        let sweeper = RequeueSweeper::new(store.clone(), clock.clone());

        Harness {
            clock,
            store,
            records,
            producer,
            dispatcher,
            sweeper,
        }
    }

    impl Harness {
        async fn like(&self, flag: LikeFlag, action: LikeAction) -> ProcessOutcome {
            self.producer
                .enqueue_like("app", "tbl", "R1", "U1", flag, action)
                .await
                .unwrap();
            self.dispatcher.process_next(WAIT).await.unwrap().unwrap()
        }

        fn counters(&self) -> (f64, f64) {
            let fields = self.records.get(&table(), "R1").unwrap();
            (
                read_counter(&fields, "resolved_count"),
                read_counter(&fields, "unresolved_count"),
            )
        }

        async fn ledger(&self) -> Option<LikeFlag> {
            self.store.get(&LedgerKey::new("R1", "U1")).await.unwrap()
        }
    }

    #[tokio::test]
    async fn like_lifecycle_scenario() {
        let h = harness();

        // add(resolved) on an empty ledger
        assert_eq!(h.like(LikeFlag::Resolved, LikeAction::Add).await, ProcessOutcome::Applied);
        assert_eq!(h.counters(), (4.0, 7.0));
        assert_eq!(h.ledger().await, Some(LikeFlag::Resolved));

        // same again: no remote write, ledger unchanged
        assert_eq!(h.like(LikeFlag::Resolved, LikeAction::Add).await, ProcessOutcome::NoOp);
        assert_eq!(h.counters(), (4.0, 7.0));
        assert_eq!(h.records.updates().len(), 1);
        assert_eq!(h.ledger().await, Some(LikeFlag::Resolved));

        // switch to unresolved
        assert_eq!(
            h.like(LikeFlag::Unresolved, LikeAction::Add).await,
            ProcessOutcome::Applied
        );
        assert_eq!(h.counters(), (3.0, 8.0));
        assert_eq!(h.ledger().await, Some(LikeFlag::Unresolved));

        // remove(unresolved)
        assert_eq!(
            h.like(LikeFlag::Unresolved, LikeAction::Remove).await,
            ProcessOutcome::Applied
        );
        assert_eq!(h.counters(), (3.0, 7.0));
        assert_eq!(h.ledger().await, None);

        // non-counter fields untouched, nothing left in any queue
        let fields = h.records.get(&table(), "R1").unwrap();
        assert_eq!(fields["title"], json!("printer on 3F is down"));
        assert_eq!(h.store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn state_switch_is_one_update_call() {
        let h = harness();
        h.store
            .set(&LedgerKey::new("R1", "U1"), LikeFlag::Unresolved)
            .await
            .unwrap();

        h.like(LikeFlag::Resolved, LikeAction::Add).await;

        let updates = h.records.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(read_counter(&updates[0].fields, "resolved_count"), 4.0);
        assert_eq!(read_counter(&updates[0].fields, "unresolved_count"), 6.0);
    }

    #[tokio::test]
    async fn single_counter_change_only_sends_that_field() {
        let h = harness();
        h.like(LikeFlag::Resolved, LikeAction::Add).await;

        let updates = h.records.updates();
        assert_eq!(updates[0].fields.len(), 1);
        assert!(updates[0].fields.contains_key("resolved_count"));
    }

    #[tokio::test]
    async fn missing_counters_start_from_zero() {
        let h = harness();
        h.records.insert(&table(), "R1", RecordFields::new());

        h.like(LikeFlag::Unresolved, LikeAction::Add).await;
        assert_eq!(h.counters(), (0.0, 1.0));
    }

    #[tokio::test]
    async fn always_failing_update_is_retried_then_dead_lettered() {
        let h = harness();
        h.records.set_always_fail_updates(true);
        let id = h
            .producer
            .enqueue_like("app", "tbl", "R1", "U1", LikeFlag::Resolved, LikeAction::Add)
            .await
            .unwrap();

        let mut delays = Vec::new();
        loop {
            let outcome = h.dispatcher.process_next(WAIT).await.unwrap().unwrap();
            if outcome == ProcessOutcome::DeadLettered {
                break;
            }
            assert_eq!(outcome, ProcessOutcome::RetryScheduled);
            assert_eq!(h.store.location(id).await, Some(TaskState::RetryScheduled));

            let release_at = h.store.retry_release_at(id).await.unwrap();
            let delay_ms = release_at - h.clock.now_millis();
            delays.push(delay_ms / 1_000);

            h.clock.advance(Duration::from_millis(delay_ms as u64));
            assert_eq!(h.sweeper.tick().await.unwrap().moved, 1);
        }

        assert_eq!(delays, vec![2, 4, 8, 16]);
        assert_eq!(h.store.location(id).await, Some(TaskState::DeadLettered));
        let dead = h.store.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].task.as_ref().unwrap().attempts, 5);
        assert!(h.records.updates().is_empty());
        assert_eq!(h.ledger().await, None);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let h = harness();
        h.records.fail_next_updates(1);

        assert_eq!(
            h.like(LikeFlag::Resolved, LikeAction::Add).await,
            ProcessOutcome::RetryScheduled
        );
        assert_eq!(h.counters(), (3.0, 7.0));
        assert_eq!(h.ledger().await, None);

        h.clock.advance(Duration::from_secs(2));
        h.sweeper.tick().await.unwrap();
        assert_eq!(
            h.dispatcher.process_next(WAIT).await.unwrap(),
            Some(ProcessOutcome::Applied)
        );
        assert_eq!(h.counters(), (4.0, 7.0));
        assert_eq!(h.ledger().await, Some(LikeFlag::Resolved));
    }

    #[tokio::test]
    async fn fetch_failure_goes_through_retry_policy() {
        let h = harness();
        h.records.set_fail_fetches(true);

        assert_eq!(
            h.like(LikeFlag::Resolved, LikeAction::Add).await,
            ProcessOutcome::RetryScheduled
        );
        let counts = h.store.counts().await.unwrap();
        assert_eq!((counts.processing, counts.retry_scheduled), (0, 1));
    }

    #[tokio::test]
    async fn unknown_record_is_dead_lettered_immediately() {
        let h = harness();
        h.producer
            .enqueue_like("app", "tbl", "ghost", "U1", LikeFlag::Resolved, LikeAction::Add)
            .await
            .unwrap();

        assert_eq!(
            h.dispatcher.process_next(WAIT).await.unwrap(),
            Some(ProcessOutcome::DeadLettered)
        );
        let dead = h.store.dead_letters(10).await.unwrap();
        assert!(dead[0].reason.contains("not found"));
        assert_eq!(dead[0].task.as_ref().unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn ledger_write_failure_keeps_the_applied_update() {
        let h = harness();
        h.store.fail_next_ledger_writes(1);
        let id = h
            .producer
            .enqueue_like("app", "tbl", "R1", "U1", LikeFlag::Resolved, LikeAction::Add)
            .await
            .unwrap();

        assert_eq!(
            h.dispatcher.process_next(WAIT).await.unwrap(),
            Some(ProcessOutcome::Applied)
        );
        // counters committed and task acked; only the ledger is behind
        assert_eq!(h.counters(), (4.0, 7.0));
        assert_eq!(h.records.updates().len(), 1);
        assert_eq!(h.store.location(id).await, None);
        assert_eq!(h.ledger().await, None);
        assert_eq!(h.store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn ledger_read_failure_goes_through_retry_policy() {
        let h = harness();
        h.store.fail_next_ledger_reads(1);
        let id = h
            .producer
            .enqueue_like("app", "tbl", "R1", "U1", LikeFlag::Resolved, LikeAction::Add)
            .await
            .unwrap();

        assert_eq!(
            h.dispatcher.process_next(WAIT).await.unwrap(),
            Some(ProcessOutcome::RetryScheduled)
        );
        assert!(h.records.updates().is_empty());
        assert_eq!(h.store.location(id).await, Some(TaskState::RetryScheduled));

        h.clock.advance(Duration::from_secs(2));
        h.sweeper.tick().await.unwrap();
        assert_eq!(
            h.dispatcher.process_next(WAIT).await.unwrap(),
            Some(ProcessOutcome::Applied)
        );
        assert_eq!(h.counters(), (4.0, 7.0));
        assert_eq!(h.ledger().await, Some(LikeFlag::Resolved));
    }

    #[tokio::test]
    async fn expired_claim_is_released_without_remote_write() {
        let h = harness();
        h.producer
            .enqueue_like("app", "tbl", "R1", "U1", LikeFlag::Resolved, LikeAction::Add)
            .await
            .unwrap();
        let task = h.store.pending_to_processing(WAIT).await.unwrap().unwrap();
        h.clock.advance(DEFAULT_CLAIM_TTL + Duration::from_secs(1));

        assert_eq!(h.dispatcher.process(task.clone()).await, ProcessOutcome::ClaimLost);
        assert!(h.records.updates().is_empty());
        assert_eq!(h.ledger().await, None);
        assert_eq!(h.store.location(task.id).await, Some(TaskState::Processing));

        // recovery hands it to the next consumer, which applies it once
        assert_eq!(h.store.recover_processing().await.unwrap(), 1);
        assert_eq!(
            h.dispatcher.process_next(WAIT).await.unwrap(),
            Some(ProcessOutcome::Applied)
        );
        assert_eq!(h.counters(), (4.0, 7.0));
        assert_eq!(h.records.updates().len(), 1);
    }

    #[tokio::test]
    async fn empty_queue_yields_none() {
        let h = harness();
        assert_eq!(h.dispatcher.process_next(WAIT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness();
        let dispatcher = Arc::new(h.dispatcher);
        let (tx, rx) = shutdown::channel();
        let settings = DispatcherSettings {
            dequeue_timeout: Duration::from_millis(20),
            idle_sleep: Duration::from_millis(20),
        };
        let worker = tokio::spawn(dispatcher.clone().run(0, settings, rx));

        h.producer
            .enqueue_like("app", "tbl", "R1", "U1", LikeFlag::Resolved, LikeAction::Add)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.records.updates().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
