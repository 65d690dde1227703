//! Like/unlike request model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The state a user can put a record in.
///
/// Each flag has its own counter field on the remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikeFlag {
    Resolved,
    Unresolved,
}

impl LikeFlag {
    /// The other flag (used for state switches).
    pub fn opposite(self) -> Self {
        match self {
            LikeFlag::Resolved => LikeFlag::Unresolved,
            LikeFlag::Unresolved => LikeFlag::Resolved,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LikeFlag::Resolved => "resolved",
            LikeFlag::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for LikeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikeAction {
    Add,
    Remove,
}

impl LikeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LikeAction::Add => "add",
            LikeAction::Remove => "remove",
        }
    }
}

impl fmt::Display for LikeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseLikeError {
    kind: &'static str,
    value: String,
}

impl FromStr for LikeFlag {
    type Err = ParseLikeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resolved" => Ok(LikeFlag::Resolved),
            "unresolved" => Ok(LikeFlag::Unresolved),
            _ => Err(ParseLikeError {
                kind: "like flag",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for LikeAction {
    type Err = ParseLikeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(LikeAction::Add),
            "remove" => Ok(LikeAction::Remove),
            _ => Err(ParseLikeError {
                kind: "like action",
                value: s.to_string(),
            }),
        }
    }
}

/// Coordinates of the remote table that holds the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub app_token: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(app_token: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            app_token: app_token.into(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_token, self.table_id)
    }
}

/// What the user asked for. Immutable once the task is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikePayload {
    #[serde(flatten)]
    pub table: TableRef,
    pub record_id: String,
    pub user_id: String,
    pub like_flag: LikeFlag,
    pub action: LikeAction,
}

impl LikePayload {
    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey::new(&self.record_id, &self.user_id)
    }
}

/// Composite key of the like-state ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub record_id: String,
    pub user_id: String,
}

impl LedgerKey {
    pub fn new(record_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// `record_id:user_id`, the field name used in hash-backed ledgers.
impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.record_id, self.user_id)
    }
}
