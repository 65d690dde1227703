//! LikeLedger port - (record, user) ごとの最後に適用した like 状態
//!
//! 冪等性のアンカー。remote のカウンタを変更する前に参照し、
//! remote の更新が成功した後にだけ書き換える。

use async_trait::async_trait;

use super::task_store::StoreError;
use crate::domain::{LedgerKey, LikeFlag};

#[async_trait]
pub trait LikeLedger: Send + Sync {
    async fn get(&self, key: &LedgerKey) -> Result<Option<LikeFlag>, StoreError>;

    async fn set(&self, key: &LedgerKey, flag: LikeFlag) -> Result<(), StoreError>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &LedgerKey) -> Result<(), StoreError>;
}
