//! Like-state resolver: decides what a task does to the remote counters.
//!
//! This is a pure function of (action, requested flag, previously applied flag).
//! It never looks at the remote counter values themselves; the dispatcher reads
//! those right before applying the delta.

use super::like::{LikeAction, LikeFlag};

/// Change to apply to the two remote counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDelta {
    pub resolved: i32,
    pub unresolved: i32,
}

impl CounterDelta {
    fn bump(flag: LikeFlag, by: i32) -> Self {
        let mut delta = Self::default();
        delta.add(flag, by);
        delta
    }

    fn add(&mut self, flag: LikeFlag, by: i32) {
        match flag {
            LikeFlag::Resolved => self.resolved += by,
            LikeFlag::Unresolved => self.unresolved += by,
        }
    }

    pub fn get(&self, flag: LikeFlag) -> i32 {
        match flag {
            LikeFlag::Resolved => self.resolved,
            LikeFlag::Unresolved => self.unresolved,
        }
    }
}

/// What to write to the ledger once the remote update succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    Set(LikeFlag),
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The user already holds the requested state; ack without writing anything.
    NoOp,
    Apply {
        delta: CounterDelta,
        ledger: LedgerEffect,
    },
}

/// Resolve a like/unlike request against the ledger.
///
/// - `add(F)` when the ledger already says `F` is a no-op.
/// - `add(F)` over the other flag is a state switch: one counter down, one up,
///   in the same delta.
/// - `add(F)` with no ledger entry bumps `F` only.
/// - `remove(F)` decrements `F` whatever the ledger says.
pub fn resolve(action: LikeAction, flag: LikeFlag, previous: Option<LikeFlag>) -> Resolution {
    match action {
        LikeAction::Add => match previous {
            Some(prev) if prev == flag => Resolution::NoOp,
            Some(prev) => {
                let mut delta = CounterDelta::bump(flag, 1);
                delta.add(prev, -1);
                Resolution::Apply {
                    delta,
                    ledger: LedgerEffect::Set(flag),
                }
            }
            None => Resolution::Apply {
                delta: CounterDelta::bump(flag, 1),
                ledger: LedgerEffect::Set(flag),
            },
        },
        // TODO: guard remove against an absent/different ledger entry once the
        // counter semantics for double-unlike are agreed on.
        LikeAction::Remove => Resolution::Apply {
            delta: CounterDelta::bump(flag, -1),
            ledger: LedgerEffect::Delete,
        },
    }
}
