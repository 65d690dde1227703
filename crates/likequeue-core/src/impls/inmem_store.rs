//! In-memory task store + ledger.
//!
//! Single-process stand-in for the shared KV store. Bodies are kept encoded
//! through `TaskCodec`, keyed by id; the four queues hold ids only. Every
//! operation runs under one lock, which makes each queue move atomic.
//!
//! 失敗注入ができる（dispatcher / sweeper の失敗経路のテスト用）:
//! - `fail_next_ledger_reads(n)` / `fail_next_ledger_writes(n)`
//! - `fail_release_of(id)`: sweep でその id の移動だけを失敗させる

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::codec::TaskCodec;
use crate::domain::{LedgerKey, LikeFlag, TaskEnvelope, TaskId, TaskState};
use crate::observability::QueueCounts;
use crate::ports::{
    AckOutcome, Clock, DEFAULT_CLAIM_TTL, DeadLetter, LikeLedger, StoreError, SweepReport,
    SystemClock, TaskStore,
};

#[derive(Default)]
struct StoreState {
    /// Encoded envelopes (single source of truth for task contents).
    bodies: HashMap<TaskId, Vec<u8>>,

    /// FIFO: push_back on enqueue, pop_front on dequeue.
    pending: VecDeque<TaskId>,

    /// id -> claim deadline (epoch ms).
    processing: BTreeMap<TaskId, i64>,

    /// (release time ms, id), earliest first.
    retry: BTreeSet<(i64, TaskId)>,
    retry_index: HashMap<TaskId, i64>,

    dead: VecDeque<TaskId>,
    dead_reasons: HashMap<TaskId, String>,

    ledger: HashMap<LedgerKey, LikeFlag>,

    /// Retry entries the sweep refuses to release.
    release_faults: HashSet<TaskId>,
}

impl StoreState {
    fn location(&self, id: TaskId) -> Option<TaskState> {
        if self.processing.contains_key(&id) {
            Some(TaskState::Processing)
        } else if self.retry_index.contains_key(&id) {
            Some(TaskState::RetryScheduled)
        } else if self.pending.contains(&id) {
            Some(TaskState::Pending)
        } else if self.dead.contains(&id) {
            Some(TaskState::DeadLettered)
        } else {
            None
        }
    }

    fn bury(&mut self, id: TaskId, reason: String) {
        self.dead.push_back(id);
        self.dead_reasons.insert(id, reason);
    }

    /// Pop the oldest pending id into processing, claimed until `claim_until`,
    /// and decode it.
    fn take_next(&mut self, claim_until: i64) -> Option<Result<TaskEnvelope, StoreError>> {
        let id = self.pending.pop_front()?;
        let decoded = match self.bodies.get(&id) {
            Some(bytes) => TaskCodec::decode(bytes).map_err(|e| e.to_string()),
            None => Err("missing body".to_string()),
        };
        Some(match decoded {
            Ok(task) => {
                self.processing.insert(id, claim_until);
                Ok(task)
            }
            Err(reason) => {
                self.bury(id, format!("malformed: {reason}"));
                Err(StoreError::Malformed {
                    id: id.to_key(),
                    reason,
                })
            }
        })
    }
}

pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    claim_ttl: Duration,
    ledger_read_failures: AtomicU32,
    ledger_write_failures: AtomicU32,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            notify: Arc::new(Notify::new()),
            clock,
            claim_ttl: DEFAULT_CLAIM_TTL,
            ledger_read_failures: AtomicU32::new(0),
            ledger_write_failures: AtomicU32::new(0),
        }
    }

    /// How long a dequeued task stays claimed. Should comfortably exceed the
    /// time one task takes to process.
    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    /// Which queue currently owns `id` (`None` once acked or never seen).
    pub async fn location(&self, id: TaskId) -> Option<TaskState> {
        self.state.lock().await.location(id)
    }

    /// Release time of a retry entry, in epoch milliseconds.
    pub async fn retry_release_at(&self, id: TaskId) -> Option<i64> {
        self.state.lock().await.retry_index.get(&id).copied()
    }

    pub fn fail_next_ledger_reads(&self, n: u32) {
        self.ledger_read_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_ledger_writes(&self, n: u32) {
        self.ledger_write_failures.store(n, Ordering::SeqCst);
    }

    /// Make the sweep fail to release `id` until `clear_release_faults`.
    pub async fn fail_release_of(&self, id: TaskId) {
        self.state.lock().await.release_faults.insert(id);
    }

    pub async fn clear_release_faults(&self) {
        self.state.lock().await.release_faults.clear();
    }

    /// Push a raw body straight into pending, bypassing the codec.
    #[cfg(test)]
    pub(crate) async fn push_raw_pending(&self, id: TaskId, body: Vec<u8>) {
        let mut state = self.state.lock().await;
        state.bodies.insert(id, body);
        state.pending.push_back(id);
        drop(state);
        self.notify.notify_one();
    }

    fn claim_until(&self) -> i64 {
        let ttl_ms = i64::try_from(self.claim_ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(ttl_ms)
    }

    fn injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue_pending(&self, task: &TaskEnvelope) -> Result<(), StoreError> {
        let body = TaskCodec::encode(task)?;
        {
            let mut state = self.state.lock().await;
            state.bodies.insert(task.id, body);
            state.pending.push_back(task.id);
        }
        // Notify outside the lock
        self.notify.notify_one();
        Ok(())
    }

    async fn pending_to_processing(
        &self,
        timeout: Duration,
    ) -> Result<Option<TaskEnvelope>, StoreError> {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        loop {
            // Register interest before looking, so a push between the check and
            // the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claim_until = self.claim_until();
            if let Some(next) = self.state.lock().await.take_next(claim_until) {
                return next.map(Some);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn still_claimed(&self, id: TaskId) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        Ok(state
            .processing
            .get(&id)
            .is_some_and(|claim_until| *claim_until > now))
    }

    async fn ack(&self, id: TaskId) -> Result<AckOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.processing.remove(&id).is_some() {
            state.bodies.remove(&id);
            Ok(AckOutcome::Acked)
        } else {
            Ok(AckOutcome::NotFound)
        }
    }

    async fn schedule_retry(
        &self,
        task: &TaskEnvelope,
        delay: Duration,
    ) -> Result<(), StoreError> {
        // encode first: a codec failure must leave the task where it is
        let body = TaskCodec::encode(task)?;
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let release_at = self.clock.now_millis().saturating_add(delay_ms);

        let mut state = self.state.lock().await;
        if state.processing.remove(&task.id).is_none() {
            return Err(StoreError::NotProcessing(task.id));
        }
        state.bodies.insert(task.id, body);
        state.retry.insert((release_at, task.id));
        state.retry_index.insert(task.id, release_at);
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        task: &TaskEnvelope,
        reason: &str,
    ) -> Result<(), StoreError> {
        let body = TaskCodec::encode(task)?;

        let mut state = self.state.lock().await;
        if state.processing.remove(&task.id).is_none() {
            return Err(StoreError::NotProcessing(task.id));
        }
        state.bodies.insert(task.id, body);
        state.bury(task.id, reason.to_string());
        Ok(())
    }

    async fn sweep_due_retries(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let now_ms = now.timestamp_millis();
        let report = {
            let mut state = self.state.lock().await;
            let due: Vec<(i64, TaskId)> = state
                .retry
                .iter()
                .take_while(|(release_at, _)| *release_at <= now_ms)
                .copied()
                .collect();

            let mut report = SweepReport::default();
            for entry in &due {
                // a failed release leaves the entry due for the next sweep
                if state.release_faults.contains(&entry.1) {
                    report.failed += 1;
                    continue;
                }
                state.retry.remove(entry);
                state.retry_index.remove(&entry.1);
                state.pending.push_back(entry.1);
                report.moved += 1;
            }
            report
        };

        for _ in 0..report.moved {
            self.notify.notify_one();
        }
        Ok(report)
    }

    async fn recover_processing(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let recovered = {
            let mut state = self.state.lock().await;
            let expired: Vec<TaskId> = state
                .processing
                .iter()
                .filter(|(_, claim_until)| **claim_until <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                state.processing.remove(id);
                state.pending.push_back(*id);
            }
            expired.len()
        };
        for _ in 0..recovered {
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(QueueCounts {
            pending: state.pending.len(),
            processing: state.processing.len(),
            retry_scheduled: state.retry.len(),
            dead: state.dead.len(),
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .dead
            .iter()
            .take(limit)
            .map(|id| DeadLetter {
                id: id.to_key(),
                reason: state.dead_reasons.get(id).cloned().unwrap_or_default(),
                task: state
                    .bodies
                    .get(id)
                    .and_then(|bytes| TaskCodec::decode(bytes).ok()),
            })
            .collect())
    }

    async fn requeue_dead(&self, id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.dead.iter().position(|d| *d == id) else {
            return Ok(false);
        };

        let mut task = match state.bodies.get(&id).map(|b| TaskCodec::decode(b)) {
            Some(Ok(task)) => task,
            Some(Err(e)) => {
                return Err(StoreError::Malformed {
                    id: id.to_key(),
                    reason: e.to_string(),
                });
            }
            None => {
                return Err(StoreError::Malformed {
                    id: id.to_key(),
                    reason: "missing body".to_string(),
                });
            }
        };
        task.attempts = 0;
        let body = TaskCodec::encode(&task)?;

        state.dead.remove(pos);
        state.dead_reasons.remove(&id);
        state.bodies.insert(id, body);
        state.pending.push_back(id);
        drop(state);

        self.notify.notify_one();
        Ok(true)
    }
}

#[async_trait]
impl LikeLedger for InMemoryTaskStore {
    async fn get(&self, key: &LedgerKey) -> Result<Option<LikeFlag>, StoreError> {
        if Self::injected(&self.ledger_read_failures) {
            return Err(StoreError::Unavailable("injected ledger read failure".into()));
        }
        Ok(self.state.lock().await.ledger.get(key).copied())
    }

    async fn set(&self, key: &LedgerKey, flag: LikeFlag) -> Result<(), StoreError> {
        if Self::injected(&self.ledger_write_failures) {
            return Err(StoreError::Unavailable("injected ledger write failure".into()));
        }
        self.state.lock().await.ledger.insert(key.clone(), flag);
        Ok(())
    }

    async fn delete(&self, key: &LedgerKey) -> Result<(), StoreError> {
        if Self::injected(&self.ledger_write_failures) {
            return Err(StoreError::Unavailable("injected ledger write failure".into()));
        }
        self.state.lock().await.ledger.remove(key);
        Ok(())
    }
}
