//! LikeQueueBuilder - コンポーネントの組み立てとライフサイクル
//!
//! プロセス全体で共有する状態はグローバルに置かず、起動時に `LikeQueue` を組み立てて
//! 必要なところへ渡す。
//!
//! # 使用例
//! ```ignore
//! let store = Arc::new(InMemoryTaskStore::default());
//! let queue = LikeQueueBuilder::new(LikeQueueConfig::from_env()?)
//!     .store(store)
//!     .record_store(Arc::new(my_table_client))
//!     .build()?;
//!
//! let running = queue.start().await?;
//! queue.producer().enqueue_like(...).await?;
//! running.shutdown_and_join().await;
//! ```
//!
//! # Fail-fast 設計
//! - build() 時に config を検証し、store / ledger / record store が揃っているかをチェック
//! - 不足があれば BuildError を返す

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::dispatcher::{Dispatcher, DispatcherSettings};
use super::producer::Producer;
use super::shutdown;
use super::sweeper::RequeueSweeper;
use crate::config::{ConfigError, LikeQueueConfig};
use crate::domain::{Decider, DefaultDecider};
use crate::ports::{
    Clock, IdGenerator, LikeLedger, RecordStore, StoreError, SystemClock, TaskStore,
    UlidGenerator,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct LikeQueueBuilder {
    config: LikeQueueConfig,
    task_store: Option<Arc<dyn TaskStore>>,
    ledger: Option<Arc<dyn LikeLedger>>,
    records: Option<Arc<dyn RecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

impl LikeQueueBuilder {
    pub fn new(config: LikeQueueConfig) -> Self {
        Self {
            config,
            task_store: None,
            ledger: None,
            records: None,
            clock: None,
            ids: None,
            decider: None,
        }
    }

    /// Use one store for both the queues and the ledger.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: TaskStore + LikeLedger + 'static,
    {
        self.task_store(store.clone()).ledger(store)
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn LikeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Defaults to `SystemClock`. Should be the clock the task store uses for
    /// retry release times.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to `DefaultDecider` over the configured retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> Result<LikeQueue, BuildError> {
        self.config.validate()?;

        let store = self
            .task_store
            .ok_or(BuildError::MissingComponent("task store"))?;
        let ledger = self.ledger.ok_or(BuildError::MissingComponent("ledger"))?;
        let records = self
            .records
            .ok_or(BuildError::MissingComponent("record store"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry_policy())));

        let producer = Producer::new(
            store.clone(),
            ids,
            clock.clone(),
            self.config.max_attempts,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            ledger,
            records,
            decider,
            self.config.counter_fields.clone(),
        ));
        let sweeper = Arc::new(RequeueSweeper::new(store.clone(), clock));

        Ok(LikeQueue {
            config: self.config,
            store,
            producer,
            dispatcher,
            sweeper,
        })
    }
}

/// The assembled queue. Components are behind `Arc`s and handed out by clone.
pub struct LikeQueue {
    config: LikeQueueConfig,
    store: Arc<dyn TaskStore>,
    producer: Producer,
    dispatcher: Arc<Dispatcher>,
    sweeper: Arc<RequeueSweeper>,
}

impl LikeQueue {
    pub fn config(&self) -> &LikeQueueConfig {
        &self.config
    }

    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sweeper(&self) -> &Arc<RequeueSweeper> {
        &self.sweeper
    }

    /// Recover tasks whose claim has expired (if configured) and spawn the
    /// dispatcher workers and the sweeper.
    pub async fn start(&self) -> Result<RunningQueue, StoreError> {
        if self.config.recover_on_start {
            let recovered = self.store.recover_processing().await?;
            if recovered > 0 {
                info!(recovered, "moved stranded processing tasks back to pending");
            }
        }

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let settings = DispatcherSettings {
            dequeue_timeout: self.config.dequeue_timeout(),
            idle_sleep: self.config.idle_sleep(),
        };

        let mut joins = Vec::with_capacity(self.config.dispatcher_workers + 1);
        for worker_id in 0..self.config.dispatcher_workers {
            let dispatcher = Arc::clone(&self.dispatcher);
            joins.push(tokio::spawn(dispatcher.run(
                worker_id,
                settings,
                shutdown_rx.clone(),
            )));
        }
        joins.push(tokio::spawn(
            Arc::clone(&self.sweeper).run(self.config.sweep_interval(), shutdown_rx),
        ));

        info!(
            workers = self.config.dispatcher_workers,
            "like queue started"
        );
        Ok(RunningQueue { shutdown_tx, joins })
    }
}

/// Handle to the running loops.
/// - `request_shutdown()` asks every loop to stop at its next suspension point
/// - `shutdown_and_join()` also waits for them
pub struct RunningQueue {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl RunningQueue {
    /// In-flight tasks are finished; no new task is dequeued.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
        info!("like queue stopped");
    }
}
