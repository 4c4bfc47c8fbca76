use super::Enqueuer;
use crate::queue::{HeightQueue, WorkItem};
use crate::runtime::telemetry::Telemetry;
use crate::source::Source;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Producer forwarding every block announced by the source subscription.
///
/// The subscription ending while the pipeline is still running is an error:
/// the indexer would otherwise silently stop following the chain.
pub struct LiveEnqueuer {
    source: Arc<dyn Source>,
    telemetry: Arc<Telemetry>,
}

impl LiveEnqueuer {
    pub fn new(source: Arc<dyn Source>, telemetry: Arc<Telemetry>) -> Self {
        Self { source, telemetry }
    }

    async fn follow(&self, queue: &HeightQueue, shutdown: &CancellationToken) -> Result<()> {
        let mut blocks = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            subscribed = self.source.subscribe_new_blocks() => {
                subscribed.context("failed to subscribe to new blocks")?
            }
        };

        tracing::info!("following new blocks");

        loop {
            let block = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                next = blocks.recv() => next,
            };

            let Some(block) = block else {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                bail!("new block subscription closed unexpectedly");
            };

            let height = block.height;
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                pushed = queue.push(WorkItem::with_block(block)) => {
                    if let Err(err) = pushed {
                        tracing::debug!(height, error = %err, "queue closed; stopping live enqueuer");
                        return Ok(());
                    }
                }
            }

            self.telemetry.record_enqueued();
            tracing::debug!(height, "new block enqueued");
        }
    }
}

impl Enqueuer for LiveEnqueuer {
    fn run(&self, queue: Arc<HeightQueue>, shutdown: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.follow(&queue, &shutdown).await })
    }
}
