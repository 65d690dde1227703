use std::error::Error;
use std::sync::Arc;

use serde_json::json;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use likequeue_core::app::LikeQueueBuilder;
use likequeue_core::config::LikeQueueConfig;
use likequeue_core::domain::{LedgerKey, LikeAction, LikeFlag, TableRef};
use likequeue_core::impls::{InMemoryRecordStore, InMemoryTaskStore};
use likequeue_core::observability::init_tracing;
use likequeue_core::ports::{LikeLedger, RecordFields, SystemClock, TaskStore};

const APP: &str = "demo-app";
const TABLE: &str = "issues";
const RECORD: &str = "R1";
const USER: &str = "U1";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = LikeQueueConfig::from_env()?;
    init_tracing(config.log_json);

    #[cfg(feature = "redis")]
    {
        if let Some(url) = config.redis_url.clone() {
            let store = likequeue_core::impls::RedisTaskStore::new(
                url,
                &config.key_prefix,
                Arc::new(SystemClock),
            )?
            .with_claim_ttl(config.claim_ttl());
            info!(prefix = %config.key_prefix, "using redis task store");
            return run(config, Arc::new(store)).await;
        }
    }

    let store = InMemoryTaskStore::new(Arc::new(SystemClock)).with_claim_ttl(config.claim_ttl());
    run(config, Arc::new(store)).await
}

async fn run<S>(config: LikeQueueConfig, store: Arc<S>) -> Result<(), Box<dyn Error>>
where
    S: TaskStore + LikeLedger + 'static,
{
    // (A) 外部テーブルの代わり。最初の update を一度だけ失敗させて retry を見せる
    let records = Arc::new(InMemoryRecordStore::new());
    let table = TableRef::new(APP, TABLE);
    let resolved_field = config.counter_fields.resolved.clone();
    let unresolved_field = config.counter_fields.unresolved.clone();
    records.insert(
        &table,
        RECORD,
        RecordFields::from([
            (resolved_field.clone(), json!(0)),
            (unresolved_field.clone(), json!(0)),
        ]),
    );
    records.fail_next_updates(1);

    // (B) 組み立てて dispatcher と sweeper を起動
    let queue = LikeQueueBuilder::new(config)
        .store(store.clone())
        .record_store(records.clone())
        .build()?;
    let running = queue.start().await?;

    // (C) シナリオを一段ずつ流す。Ctrl-C で中断
    let steps = [
        (LikeAction::Add, LikeFlag::Resolved, "first like"),
        (LikeAction::Add, LikeFlag::Resolved, "same like again (no-op)"),
        (LikeAction::Add, LikeFlag::Unresolved, "switch to unresolved"),
        (LikeAction::Remove, LikeFlag::Unresolved, "remove"),
    ];
    let scenario = async {
        let producer = queue.producer();
        for (action, flag, label) in steps {
            let id = producer
                .enqueue_like(APP, TABLE, RECORD, USER, flag, action)
                .await?;
            println!("enqueued {id}: {label}");

            wait_until_settled(store.as_ref()).await?;
            if let Some(fields) = records.get(&table, RECORD) {
                println!(
                    "  {resolved_field}={} {unresolved_field}={}",
                    fields.get(&resolved_field).unwrap_or(&json!(null)),
                    fields.get(&unresolved_field).unwrap_or(&json!(null)),
                );
            }
        }
        Ok::<(), Box<dyn Error>>(())
    };

    tokio::select! {
        result = scenario => result?,
        _ = tokio::signal::ctrl_c() => warn!("interrupted, shutting down"),
    }

    // (D) graceful shutdown: 処理中のタスクは最後まで終わらせる
    running.shutdown_and_join().await;

    let counts = store.counts().await?;
    println!("counts: {}", serde_json::to_string(&counts)?);
    println!("remote updates: {}", records.updates().len());
    println!(
        "ledger[{RECORD},{USER}] = {:?}",
        store.get(&LedgerKey::new(RECORD, USER)).await?
    );
    for dead in store.dead_letters(10).await? {
        println!("dead letter {}: {}", dead.id, dead.reason);
    }
    info!("demo finished");
    Ok(())
}

/// Poll until nothing is pending, in flight or waiting for a retry.
async fn wait_until_settled<S: TaskStore + ?Sized>(store: &S) -> Result<(), Box<dyn Error>> {
    loop {
        let counts = store.counts().await?;
        if counts.pending + counts.processing + counts.retry_scheduled == 0 {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
}
