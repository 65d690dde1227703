//! likequeue-core
//!
//! Idempotent like/vote task queue. Producers enqueue like/unlike requests;
//! dispatcher workers apply them to counters on a remote table exactly once per
//! state change, with retry/backoff and a dead-letter queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, like payload, envelope, resolver, decision, state）
//! - **ports**: 抽象化レイヤー（TaskStore, LikeLedger, RecordStore, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, producer, dispatcher, sweeper, retry）
//! - **impls**: 実装（InMemoryTaskStore, InMemoryRecordStore, RedisTaskStore）
//! - **codec**: タスク本体の JSON 形式
//! - **config**: 環境変数からの設定
//! - **observability**: tracing の初期化とキューの件数

pub mod app;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{LikeQueue, LikeQueueBuilder, Producer, RunningQueue};
pub use config::LikeQueueConfig;
pub use error::LikeQueueError;
