//! Consumers draining the height queue.

pub mod pool;

use crate::modules::ModuleDispatcher;
use crate::queue::{HeightQueue, WorkItem};
use crate::repository::Repository;
use crate::rpc::RpcError;
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::Telemetry;
use crate::source::Source;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use pool::WorkerPool;

/// Collaborators shared by every worker of a pool.
#[derive(Clone)]
pub struct WorkerShared {
    pub source: Arc<dyn Source>,
    pub repository: Arc<dyn Repository>,
    pub queue: Arc<HeightQueue>,
    pub dispatcher: ModuleDispatcher,
    pub telemetry: Arc<Telemetry>,
    pub progress: Arc<ProgressTracker>,
    /// Failed attempts after which a height is dropped; `None` retries forever.
    pub max_attempts: Option<usize>,
}

/// What happened to a height popped from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Indexed,
    /// The block row already existed; nothing was fetched or written.
    AlreadyIndexed,
}

pub struct Worker {
    pub id: usize,
    shared: WorkerShared,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(id: usize, shared: WorkerShared, shutdown: CancellationToken) -> Self {
        Self {
            id,
            shared,
            shutdown,
        }
    }

    /// Pops and processes items until shutdown or until the queue is closed.
    ///
    /// A popped item is always finished, even if shutdown is requested while
    /// it is being processed.
    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    pub async fn run(self) -> Result<()> {
        tracing::debug!(worker = self.id, "worker task started");

        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(worker = self.id, "shutdown requested; exiting worker loop");
                    break;
                }
                item = self.shared.queue.pop() => item,
            };

            let Some(item) = item else {
                tracing::debug!(worker = self.id, "queue closed; exiting worker loop");
                break;
            };

            self.handle(item).await;
        }

        Ok(())
    }

    async fn handle(&self, item: WorkItem) {
        let height = item.height;
        match self.process(&item).await {
            Ok(ProcessOutcome::Indexed) => {
                tracing::debug!(worker = self.id, height, "height indexed");
            }
            Ok(ProcessOutcome::AlreadyIndexed) => {
                self.shared.telemetry.record_skipped();
                tracing::trace!(worker = self.id, height, "height already indexed");
            }
            Err(err) => self.retry(item, err),
        }
        self.shared.queue.complete();
    }

    /// Idempotently indexes one height.
    ///
    /// Core records are written validators first and the block row last, so
    /// the block row existing implies everything else for the height does.
    pub async fn process(&self, item: &WorkItem) -> Result<ProcessOutcome> {
        let height = item.height;
        let WorkerShared {
            source,
            repository,
            dispatcher,
            telemetry,
            progress,
            ..
        } = &self.shared;

        if !item.force
            && repository
                .has_block(height)
                .await
                .with_context(|| format!("failed to check whether height {height} is stored"))?
        {
            return Ok(ProcessOutcome::AlreadyIndexed);
        }

        let fetched;
        let block = match &item.block {
            Some(block) => block,
            None => {
                fetched = source
                    .block(height)
                    .await
                    .with_context(|| format!("failed to fetch block {height}"))?;
                &fetched
            }
        };
        let txs = source
            .txs(block)
            .await
            .with_context(|| format!("failed to fetch transactions of block {height}"))?;
        let validators = source
            .validators(height)
            .await
            .with_context(|| format!("failed to fetch validators at height {height}"))?;

        repository
            .save_validators(&validators.deduplicated())
            .await
            .with_context(|| format!("failed to save validators at height {height}"))?;
        let signatures = match block.commit_signatures(&validators) {
            Ok(signatures) => signatures,
            Err(unknown) => {
                let signed = block.last_commit.height;
                if signed == 0 || signed == validators.height {
                    return Err(anyhow::Error::new(unknown)
                        .context(format!("failed to join commit signatures of block {height}")));
                }
                tracing::warn!(
                    height,
                    signed_height = signed,
                    validator = %unknown.address,
                    "commit signer left the validator set, joining against the signed height"
                );
                let signers = source
                    .validators(signed)
                    .await
                    .with_context(|| format!("failed to fetch validators at height {signed}"))?;
                repository
                    .save_validators(&signers.deduplicated())
                    .await
                    .with_context(|| format!("failed to save validators at height {signed}"))?;
                block.commit_signatures(&signers).with_context(|| {
                    format!("failed to join commit signatures of block {height}")
                })?
            }
        };
        repository
            .save_commit_signatures(&signatures)
            .await
            .with_context(|| format!("failed to save commit signatures of block {height}"))?;
        for tx in &txs {
            repository
                .save_tx(tx)
                .await
                .with_context(|| format!("failed to save tx {} at height {height}", tx.hash))?;
        }
        repository
            .save_block(block)
            .await
            .with_context(|| format!("failed to save block {height}"))?;

        progress.mark_indexed(height);
        telemetry.record_indexed();

        dispatcher.dispatch_block(block, &txs, &validators).await;

        Ok(ProcessOutcome::Indexed)
    }

    /// Puts a failed item back on the queue without waiting for a free slot.
    fn retry(&self, mut item: WorkItem, err: anyhow::Error) {
        let height = item.height;
        item.attempts += 1;
        self.shared.telemetry.record_failed_attempt();
        match err.downcast_ref::<RpcError>() {
            Some(RpcError::Timeout { .. }) => self.shared.telemetry.record_rpc_timeout(),
            Some(_) => self.shared.telemetry.record_rpc_error(),
            None => {}
        }

        if let Some(max) = self.shared.max_attempts {
            if item.attempts >= max {
                tracing::error!(
                    worker = self.id,
                    height,
                    attempts = item.attempts,
                    error = format!("{err:#}"),
                    "height failed too many times; dropping it"
                );
                self.shared.telemetry.record_dropped();
                return;
            }
        }

        tracing::warn!(
            worker = self.id,
            height,
            attempts = item.attempts,
            error = format!("{err:#}"),
            "failed to index height; re-enqueueing"
        );
        self.shared.telemetry.record_requeued();
        // a prefetched block may be the cause; fetch it fresh on retry
        item.block = None;
        let _ = self.shared.queue.requeue(item);
    }
}
