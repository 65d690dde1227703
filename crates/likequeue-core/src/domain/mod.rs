//! Domain model (ids, like requests, envelope, resolver, decisions).
//!
//! ここにあるものは I/O を持たない。store や remote table への書き込みは
//! `app` 層が `ports` を通して行う。

pub mod decision;
pub mod envelope;
pub mod ids;
pub mod like;
pub mod resolver;
pub mod state;

pub use decision::{Decider, Decision, DefaultDecider};
pub use envelope::{DEFAULT_MAX_ATTEMPTS, TaskEnvelope};
pub use ids::TaskId;
pub use like::{LedgerKey, LikeAction, LikeFlag, LikePayload, ParseLikeError, TableRef};
pub use resolver::{CounterDelta, LedgerEffect, Resolution, resolve};
pub use state::TaskState;
