//! Read/write accessor to the relational store.
//!
//! Writes must follow "insert, do nothing on conflict" (or upsert) semantics:
//! two workers may race on the same height and both attempts must succeed.

pub mod memory;

use crate::types::{Block, CommitSignature, MessageRecord, Transaction, Validator};
use anyhow::Result;
use futures::future::BoxFuture;

pub trait Repository: Send + Sync + 'static {
    /// Whether the block row for `height` exists. The block row is written
    /// last, so its presence means the height is durably indexed.
    fn has_block(&self, height: u64) -> BoxFuture<'_, Result<bool>>;

    fn save_block<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, Result<()>>;

    /// Upserts validators keyed by consensus address.
    fn save_validators<'a>(&'a self, validators: &'a [Validator]) -> BoxFuture<'a, Result<()>>;

    fn save_commit_signatures<'a>(
        &'a self,
        signatures: &'a [CommitSignature],
    ) -> BoxFuture<'a, Result<()>>;

    fn save_tx<'a>(&'a self, tx: &'a Transaction) -> BoxFuture<'a, Result<()>>;

    fn save_message<'a>(&'a self, message: &'a MessageRecord) -> BoxFuture<'a, Result<()>>;

    /// Highest stored block height, `0` when the store is empty.
    fn last_block_height(&self) -> BoxFuture<'_, Result<u64>>;

    /// Heights in `[start, end]` without a block row, ascending.
    fn missing_heights(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Vec<u64>>>;

    /// Pruning capability, if the store supports it.
    fn as_pruning(&self) -> Option<&dyn PruningRepository> {
        None
    }

    /// Closes the connection pool. Called once during shutdown.
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Optional store capability required by the pruning module.
pub trait PruningRepository: Send + Sync {
    /// Last pruned height watermark, `0` if nothing was pruned yet.
    fn last_pruned(&self) -> BoxFuture<'_, Result<u64>>;

    fn store_last_pruned(&self, height: u64) -> BoxFuture<'_, Result<()>>;

    /// Deletes the fine-grained rows (commit signatures, messages) of `height`.
    fn prune(&self, height: u64) -> BoxFuture<'_, Result<()>>;
}
