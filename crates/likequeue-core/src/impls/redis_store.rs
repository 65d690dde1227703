//! Redis-backed task store + ledger (feature `redis`).
//!
//! Key layout under a configurable prefix (default `likequeue`):
//!
//! - `{prefix}:tasks` hash, task id → encoded envelope
//! - `{prefix}:pending` list, LPUSH on enqueue, consumed from the right
//! - `{prefix}:processing` list, ids moved over from pending
//! - `{prefix}:processing:claims` sorted set, score = claim deadline in epoch ms
//! - `{prefix}:retry` sorted set, score = release time in epoch ms
//! - `{prefix}:dead` list, oldest first
//! - `{prefix}:dead:reasons` hash, task id → reason
//! - `{prefix}:ledger` hash, `record_id:user_id` → like flag
//!
//! Every queue move is one Lua script, so an id is never in two queues and
//! never in none. A dequeue writes the claim in the same script; every move
//! out of processing drops it. The client is synchronous; each call runs on
//! the blocking pool with its own connection, and dequeue polls instead of
//! blocking a pooled thread.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::{instrument, warn};

use crate::codec::TaskCodec;
use crate::domain::{LedgerKey, LikeFlag, TaskEnvelope, TaskId};
use crate::observability::QueueCounts;
use crate::ports::{
    AckOutcome, Clock, DEFAULT_CLAIM_TTL, DeadLetter, LikeLedger, StoreError, SweepReport,
    TaskStore,
};

/// Pause between dequeue attempts on an empty pending list.
const DEQUEUE_POLL: Duration = Duration::from_millis(50);

const TAKE: &str = r"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if id then redis.call('ZADD', KEYS[3], ARGV[1], id) end
return id
";

const ACK: &str = r"
local n = redis.call('LREM', KEYS[1], 1, ARGV[1])
if n > 0 then
  redis.call('HDEL', KEYS[2], ARGV[1])
  redis.call('ZREM', KEYS[3], ARGV[1])
end
return n
";

const SCHEDULE_RETRY: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then return 0 end
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
";

// ARGV[3] (body) is absent when burying an undecodable task.
const DEAD_LETTER: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then return 0 end
redis.call('ZREM', KEYS[5], ARGV[1])
if ARGV[3] then redis.call('HSET', KEYS[4], ARGV[1], ARGV[3]) end
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
return 1
";

const RELEASE_DUE: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
";

// Oldest first; an id without a claim entry counts as expired.
const RECOVER: &str = r"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
local n = 0
for i = #ids, 1, -1 do
  local id = ids[i]
  local until_ms = redis.call('ZSCORE', KEYS[3], id)
  if (not until_ms) or tonumber(until_ms) <= tonumber(ARGV[1]) then
    redis.call('LREM', KEYS[1], 1, id)
    redis.call('ZREM', KEYS[3], id)
    redis.call('LPUSH', KEYS[2], id)
    n = n + 1
  end
end
return n
";

const REQUEUE_DEAD: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
redis.call('LPUSH', KEYS[4], ARGV[1])
return 1
";

#[derive(Debug, Clone)]
struct Keys {
    tasks: String,
    pending: String,
    processing: String,
    claims: String,
    retry: String,
    dead: String,
    dead_reasons: String,
    ledger: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            tasks: format!("{prefix}:tasks"),
            pending: format!("{prefix}:pending"),
            processing: format!("{prefix}:processing"),
            claims: format!("{prefix}:processing:claims"),
            retry: format!("{prefix}:retry"),
            dead: format!("{prefix}:dead"),
            dead_reasons: format!("{prefix}:dead:reasons"),
            ledger: format!("{prefix}:ledger"),
        }
    }
}

pub struct RedisTaskStore {
    client: Arc<redis::Client>,
    keys: Arc<Keys>,
    clock: Arc<dyn Clock>,
    claim_ttl: Duration,
}

impl RedisTaskStore {
    /// `redis_url` like `redis://localhost:6379`. No connection is made until
    /// the first operation.
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(format!("redis connection error: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            keys: Arc::new(Keys::new(key_prefix)),
            clock,
            claim_ttl: DEFAULT_CLAIM_TTL,
        })
    }

    /// How long a dequeued task stays claimed. Should comfortably exceed the
    /// time one task takes to process.
    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    fn claim_until(&self) -> i64 {
        let ttl_ms = i64::try_from(self.claim_ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(ttl_ms)
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection, &Keys) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        let keys = Arc::clone(&self.keys);
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection()?;
            f(&mut conn, &keys)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("{op} aborted: {e}")))?
        .map_err(|e| StoreError::Unavailable(format!("{op} failed: {e}")))
    }

    /// Move an id that was just taken into processing straight to dead.
    async fn bury_malformed(&self, raw_id: String, reason: String) -> StoreError {
        let dead_reason = format!("malformed: {reason}");
        let id = raw_id.clone();
        let buried = self
            .with_conn("bury malformed", move |conn, keys| {
                Script::new(DEAD_LETTER)
                    .key(&keys.processing)
                    .key(&keys.dead)
                    .key(&keys.dead_reasons)
                    .key(&keys.tasks)
                    .key(&keys.claims)
                    .arg(&id)
                    .arg(&dead_reason)
                    .invoke::<i64>(conn)
            })
            .await;
        if let Err(err) = buried {
            warn!(task_id = %raw_id, error = %err, "could not dead-letter malformed task");
        }
        StoreError::Malformed { id: raw_id, reason }
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn enqueue_pending(&self, task: &TaskEnvelope) -> Result<(), StoreError> {
        let body = TaskCodec::encode(task)?;
        let id = task.id.to_key();
        self.with_conn("enqueue", move |conn, keys| {
            redis::pipe()
                .atomic()
                .hset(&keys.tasks, &id, body)
                .ignore()
                .lpush(&keys.pending, &id)
                .ignore()
                .query::<()>(conn)
        })
        .await
    }

    async fn pending_to_processing(
        &self,
        timeout: Duration,
    ) -> Result<Option<TaskEnvelope>, StoreError> {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        let taken = loop {
            let claim_until = self.claim_until();
            let taken = self
                .with_conn("dequeue", move |conn, keys| {
                    let id: Option<String> = Script::new(TAKE)
                        .key(&keys.pending)
                        .key(&keys.processing)
                        .key(&keys.claims)
                        .arg(claim_until)
                        .invoke(conn)?;
                    let Some(id) = id else {
                        return Ok(None);
                    };
                    let body: Option<Vec<u8>> = redis::cmd("HGET")
                        .arg(&keys.tasks)
                        .arg(&id)
                        .query(conn)?;
                    Ok(Some((id, body)))
                })
                .await?;
            if taken.is_some() {
                break taken;
            }

            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.min(DEQUEUE_POLL)
                }
                None => DEQUEUE_POLL,
            };
            tokio::time::sleep(pause).await;
        };

        let Some((raw_id, body)) = taken else {
            return Ok(None);
        };
        if TaskId::from_str(&raw_id).is_err() {
            return Err(self.bury_malformed(raw_id, "invalid task id".into()).await);
        }
        let Some(body) = body else {
            return Err(self.bury_malformed(raw_id, "missing body".into()).await);
        };
        match TaskCodec::decode(&body) {
            Ok(task) => Ok(Some(task)),
            Err(e) => Err(self.bury_malformed(raw_id, e.to_string()).await),
        }
    }

    async fn still_claimed(&self, id: TaskId) -> Result<bool, StoreError> {
        let id = id.to_key();
        let now = self.clock.now_millis();
        let claim_until: Option<f64> = self
            .with_conn("check claim", move |conn, keys| {
                redis::cmd("ZSCORE").arg(&keys.claims).arg(&id).query(conn)
            })
            .await?;
        Ok(claim_until.is_some_and(|until| until > now as f64))
    }

    async fn ack(&self, id: TaskId) -> Result<AckOutcome, StoreError> {
        let id = id.to_key();
        let removed = self
            .with_conn("ack", move |conn, keys| {
                Script::new(ACK)
                    .key(&keys.processing)
                    .key(&keys.tasks)
                    .key(&keys.claims)
                    .arg(&id)
                    .invoke::<i64>(conn)
            })
            .await?;
        Ok(if removed > 0 {
            AckOutcome::Acked
        } else {
            AckOutcome::NotFound
        })
    }

    #[instrument(skip(self, task), fields(task_id = %task.id), err)]
    async fn schedule_retry(
        &self,
        task: &TaskEnvelope,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let body = TaskCodec::encode(task)?;
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let release_at = self.clock.now_millis().saturating_add(delay_ms);
        let id = task.id.to_key();

        let moved = self
            .with_conn("schedule retry", move |conn, keys| {
                Script::new(SCHEDULE_RETRY)
                    .key(&keys.processing)
                    .key(&keys.retry)
                    .key(&keys.tasks)
                    .key(&keys.claims)
                    .arg(&id)
                    .arg(release_at)
                    .arg(body)
                    .invoke::<i64>(conn)
            })
            .await?;
        if moved == 0 {
            return Err(StoreError::NotProcessing(task.id));
        }
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id), err)]
    async fn move_to_dead_letter(
        &self,
        task: &TaskEnvelope,
        reason: &str,
    ) -> Result<(), StoreError> {
        let body = TaskCodec::encode(task)?;
        let id = task.id.to_key();
        let reason = reason.to_string();

        let moved = self
            .with_conn("dead-letter", move |conn, keys| {
                Script::new(DEAD_LETTER)
                    .key(&keys.processing)
                    .key(&keys.dead)
                    .key(&keys.dead_reasons)
                    .key(&keys.tasks)
                    .key(&keys.claims)
                    .arg(&id)
                    .arg(&reason)
                    .arg(body)
                    .invoke::<i64>(conn)
            })
            .await?;
        if moved == 0 {
            return Err(StoreError::NotProcessing(task.id));
        }
        Ok(())
    }

    async fn sweep_due_retries(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let now_ms = now.timestamp_millis();
        self.with_conn("sweep retries", move |conn, keys| {
            let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&keys.retry)
                .arg("-inf")
                .arg(now_ms)
                .query(conn)?;

            let mut report = SweepReport::default();
            let release = Script::new(RELEASE_DUE);
            for id in &due {
                let result = release
                    .key(&keys.retry)
                    .key(&keys.pending)
                    .arg(id)
                    .invoke::<i64>(conn);
                match result {
                    Ok(1) => report.moved += 1,
                    // already released by another sweeper
                    Ok(_) => {}
                    Err(err) => {
                        warn!(task_id = %id, error = %err, "failed to release due retry");
                        report.failed += 1;
                    }
                }
            }
            Ok(report)
        })
        .await
    }

    async fn recover_processing(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let recovered = self
            .with_conn("recover processing", move |conn, keys| {
                Script::new(RECOVER)
                    .key(&keys.processing)
                    .key(&keys.pending)
                    .key(&keys.claims)
                    .arg(now)
                    .invoke::<i64>(conn)
            })
            .await?;
        Ok(usize::try_from(recovered).unwrap_or_default())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let (pending, processing, retry_scheduled, dead) = self
            .with_conn("counts", |conn, keys| {
                redis::pipe()
                    .llen(&keys.pending)
                    .llen(&keys.processing)
                    .zcard(&keys.retry)
                    .llen(&keys.dead)
                    .query::<(usize, usize, usize, usize)>(conn)
            })
            .await?;
        Ok(QueueCounts {
            pending,
            processing,
            retry_scheduled,
            dead,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let rows = self
            .with_conn("list dead letters", move |conn, keys| {
                let ids: Vec<String> = redis::cmd("LRANGE")
                    .arg(&keys.dead)
                    .arg(0)
                    .arg(stop)
                    .query(conn)?;
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let reasons: Vec<Option<String>> = redis::cmd("HMGET")
                    .arg(&keys.dead_reasons)
                    .arg(&ids)
                    .query(conn)?;
                let bodies: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
                    .arg(&keys.tasks)
                    .arg(&ids)
                    .query(conn)?;
                Ok(ids
                    .into_iter()
                    .zip(reasons)
                    .zip(bodies)
                    .map(|((id, reason), body)| (id, reason, body))
                    .collect::<Vec<_>>())
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, reason, body)| DeadLetter {
                id,
                reason: reason.unwrap_or_default(),
                task: body.and_then(|bytes| TaskCodec::decode(&bytes).ok()),
            })
            .collect())
    }

    async fn requeue_dead(&self, id: TaskId) -> Result<bool, StoreError> {
        let key = id.to_key();
        let lookup_key = key.clone();
        let (position, body) = self
            .with_conn("find dead letter", move |conn, keys| {
                let position: Option<i64> = redis::cmd("LPOS")
                    .arg(&keys.dead)
                    .arg(&lookup_key)
                    .query(conn)?;
                let body: Option<Vec<u8>> = redis::cmd("HGET")
                    .arg(&keys.tasks)
                    .arg(&lookup_key)
                    .query(conn)?;
                Ok((position, body))
            })
            .await?;
        if position.is_none() {
            return Ok(false);
        }

        let mut task = match body.map(|bytes| TaskCodec::decode(&bytes)) {
            Some(Ok(task)) => task,
            Some(Err(e)) => {
                return Err(StoreError::Malformed {
                    id: key,
                    reason: e.to_string(),
                });
            }
            None => {
                return Err(StoreError::Malformed {
                    id: key,
                    reason: "missing body".into(),
                });
            }
        };
        task.attempts = 0;
        let body = TaskCodec::encode(&task)?;

        let moved = self
            .with_conn("requeue dead letter", move |conn, keys| {
                Script::new(REQUEUE_DEAD)
                    .key(&keys.dead)
                    .key(&keys.dead_reasons)
                    .key(&keys.tasks)
                    .key(&keys.pending)
                    .arg(&key)
                    .arg(body)
                    .invoke::<i64>(conn)
            })
            .await?;
        Ok(moved > 0)
    }
}

#[async_trait]
impl LikeLedger for RedisTaskStore {
    async fn get(&self, key: &LedgerKey) -> Result<Option<LikeFlag>, StoreError> {
        let field = key.to_string();
        let lookup = field.clone();
        let raw: Option<String> = self
            .with_conn("ledger get", move |conn, keys| {
                redis::cmd("HGET").arg(&keys.ledger).arg(&lookup).query(conn)
            })
            .await?;
        raw.map(|value| {
            LikeFlag::from_str(&value).map_err(|e| StoreError::Malformed {
                id: field,
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn set(&self, key: &LedgerKey, flag: LikeFlag) -> Result<(), StoreError> {
        let field = key.to_string();
        self.with_conn("ledger set", move |conn, keys| {
            redis::cmd("HSET")
                .arg(&keys.ledger)
                .arg(&field)
                .arg(flag.as_str())
                .query::<()>(conn)
        })
        .await
    }

    async fn delete(&self, key: &LedgerKey) -> Result<(), StoreError> {
        let field = key.to_string();
        self.with_conn("ledger delete", move |conn, keys| {
            redis::cmd("HDEL")
                .arg(&keys.ledger)
                .arg(&field)
                .query::<()>(conn)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LikeAction, LikePayload, TableRef};
    use crate::ports::SystemClock;
    use ulid::Ulid;

    #[test]
    fn keys_share_the_prefix() {
        let keys = Keys::new("likes-test");
        assert_eq!(keys.pending, "likes-test:pending");
        assert_eq!(keys.processing, "likes-test:processing");
        assert_eq!(keys.claims, "likes-test:processing:claims");
        assert_eq!(keys.retry, "likes-test:retry");
        assert_eq!(keys.dead_reasons, "likes-test:dead:reasons");
        assert_eq!(keys.ledger, "likes-test:ledger");
    }

    #[test]
    fn invalid_url_is_rejected() {
        let result = RedisTaskStore::new("not a url", "likequeue", Arc::new(SystemClock));
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    /// Needs a live server: `LIKEQUEUE_TEST_REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn queue_moves_against_live_redis() {
        let Ok(url) = std::env::var("LIKEQUEUE_TEST_REDIS_URL") else {
            return;
        };
        let prefix = format!("likequeue-test-{}", Ulid::new());
        let store = RedisTaskStore::new(url, &prefix, Arc::new(SystemClock)).unwrap();

        let task = TaskEnvelope::new(
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
        store.enqueue_pending(&task).await.unwrap();
        let mut leased = store
            .pending_to_processing(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased, task);
        assert!(store.still_claimed(task.id).await.unwrap());
        // a live claim is not recovered
        assert_eq!(store.recover_processing().await.unwrap(), 0);

        leased.record_failure();
        store.schedule_retry(&leased, Duration::ZERO).await.unwrap();
        let report = store.sweep_due_retries(Utc::now()).await.unwrap();
        assert_eq!(report.moved, 1);

        let again = store
            .pending_to_processing(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(store.ack(again.id).await.unwrap(), AckOutcome::Acked);
        assert!(!store.still_claimed(again.id).await.unwrap());
        assert_eq!(store.ack(again.id).await.unwrap(), AckOutcome::NotFound);
        assert_eq!(store.counts().await.unwrap().total(), 0);

        let key = LedgerKey::new("rec1", "u1");
        store.set(&key, LikeFlag::Unresolved).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(LikeFlag::Unresolved));
        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
