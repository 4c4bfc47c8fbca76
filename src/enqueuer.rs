//! Producers feeding the height queue.

pub mod backfill;
pub mod live;

use crate::queue::HeightQueue;
use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use backfill::{BackfillEnqueuer, BackfillStrategy, BackfillTarget};
pub use live::LiveEnqueuer;

/// Keeps pushing work into `queue` until done or `shutdown` is cancelled.
///
/// Returning `Ok` means the producer finished (or was cancelled); an `Err`
/// means it can no longer produce and the pipeline must not keep running as
/// if it could.
pub trait Enqueuer: Send + Sync {
    fn run(&self, queue: Arc<HeightQueue>, shutdown: CancellationToken) -> BoxFuture<'_, Result<()>>;
}
