//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（Redis などの KV store、like カウンタを持つ外部テーブル）への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod id_generator;
pub mod ledger;
pub mod record_store;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ledger::LikeLedger;
pub use self::record_store::{RecordFields, RecordStore, RemoteError, read_counter};
pub use self::task_store::{
    AckOutcome, DEFAULT_CLAIM_TTL, DeadLetter, StoreError, SweepReport, TaskStore,
};
