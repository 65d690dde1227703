//! App - アプリケーション層
//!
//! ports を組み合わせて like キューの振る舞いを実装する。
//!
//! # 主要コンポーネント
//! - **LikeQueueBuilder**: コンポーネントの組み立てと起動
//! - **Producer**: like/unlike リクエストを pending に積む
//! - **Dispatcher**: pending → processing → remote table 更新 → ack
//! - **RequeueSweeper**: 期限が来た retry を pending に戻す
//! - **RetryPolicy**: 指数バックオフ

pub mod builder;
pub mod dispatcher;
pub mod producer;
pub mod record_locks;
pub mod retry;
pub mod shutdown;
pub mod sweeper;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, LikeQueue, LikeQueueBuilder, RunningQueue};
pub use self::dispatcher::{Dispatcher, DispatcherSettings, ProcessOutcome};
pub use self::producer::Producer;
pub use self::record_locks::{RecordLease, RecordLocks};
pub use self::retry::RetryPolicy;
pub use self::sweeper::RequeueSweeper;
