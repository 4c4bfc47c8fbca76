//! Read-only accessor to the upstream node.

use crate::types::{Block, GenesisDoc, Transaction, ValidatorSet};
use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Stream of newly finalized blocks. The sender side closing means the
/// subscription is gone and will not produce anything else.
pub type NewBlockStream = mpsc::Receiver<Block>;

/// Trait implemented by upstream chain data providers.
///
/// Implementations own their own synchronization; the pipeline calls them
/// concurrently from every worker and producer task.
pub trait Source: Send + Sync + 'static {
    /// Height of the most recent block the node has finalized.
    fn latest_height(&self) -> BoxFuture<'_, Result<u64>>;

    fn block(&self, height: u64) -> BoxFuture<'_, Result<Block>>;

    /// Transactions included in `block`, in block order.
    fn txs<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, Result<Vec<Transaction>>>;

    /// Validator set active at `height`.
    fn validators(&self, height: u64) -> BoxFuture<'_, Result<ValidatorSet>>;

    fn genesis(&self) -> BoxFuture<'_, Result<GenesisDoc>>;

    /// Subscribes to new-block events.
    fn subscribe_new_blocks(&self) -> BoxFuture<'_, Result<NewBlockStream>>;

    /// Releases connections and background tasks. Called once during shutdown.
    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
