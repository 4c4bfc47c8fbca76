use super::Enqueuer;
use crate::queue::{HeightQueue, WorkItem};
use crate::repository::Repository;
use crate::runtime::config::IndexerConfig;
use crate::runtime::telemetry::Telemetry;
use crate::source::Source;
use anyhow::Result;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound of a backfill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillTarget {
    /// Stop after this height.
    Height(u64),
    /// Follow the node's head, re-reading it whenever the scan catches up.
    ChainHead,
}

/// How heights already in the repository are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillStrategy {
    /// Ask the repository height by height and push only absent heights.
    #[default]
    SkipExisting,
    /// Push every height flagged for re-processing.
    Force,
    /// Fetch the absent heights of the whole range in one repository query.
    Missing,
}

/// Producer scanning a height range in ascending order.
///
/// A failing lookup is retried for the same height after `retry_delay`; the
/// scan never skips past a height it could not check.
pub struct BackfillEnqueuer {
    source: Arc<dyn Source>,
    repository: Arc<dyn Repository>,
    telemetry: Arc<Telemetry>,
    start: u64,
    target: BackfillTarget,
    strategy: BackfillStrategy,
    retry_delay: Duration,
    head_refresh_interval: Duration,
}

impl BackfillEnqueuer {
    pub fn new(
        source: Arc<dyn Source>,
        repository: Arc<dyn Repository>,
        telemetry: Arc<Telemetry>,
        start: u64,
        target: BackfillTarget,
    ) -> Self {
        Self {
            source,
            repository,
            telemetry,
            start,
            target,
            strategy: BackfillStrategy::default(),
            retry_delay: Duration::from_secs(2),
            head_refresh_interval: Duration::from_secs(10),
        }
    }

    /// Backfill described by `config`: from `start_height` to `end_height`
    /// (or the chain head), retry and refresh timings included.
    pub fn from_config(
        config: &IndexerConfig,
        source: Arc<dyn Source>,
        repository: Arc<dyn Repository>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let target = match config.end_height() {
            Some(end) => BackfillTarget::Height(end),
            None => BackfillTarget::ChainHead,
        };
        Self::new(source, repository, telemetry, config.start_height(), target)
            .with_retry_delay(config.backfill_retry_delay())
            .with_head_refresh_interval(config.head_refresh_interval())
    }

    pub fn with_strategy(mut self, strategy: BackfillStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_head_refresh_interval(mut self, interval: Duration) -> Self {
        self.head_refresh_interval = interval;
        self
    }

    async fn scan(&self, queue: &HeightQueue, shutdown: &CancellationToken) -> Result<()> {
        let Some(mut end) = self.resolve_end(shutdown).await else {
            return Ok(());
        };
        let mut next = self.start;

        tracing::info!(
            start = self.start,
            end,
            strategy = ?self.strategy,
            "backfill started"
        );

        loop {
            if next > end {
                match self.target {
                    BackfillTarget::Height(_) => {
                        tracing::info!(start = self.start, end, "backfill finished");
                        return Ok(());
                    }
                    BackfillTarget::ChainHead => {
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(self.head_refresh_interval) => {}
                        }
                        let Some(head) = self.resolve_end(shutdown).await else {
                            return Ok(());
                        };
                        if head > end {
                            tracing::debug!(previous = end, head, "chain head advanced");
                        }
                        end = end.max(head);
                        continue;
                    }
                }
            }

            match self.strategy {
                BackfillStrategy::Missing => {
                    let (from, to) = (next, end);
                    let Some(missing) = self
                        .retrying("missing heights lookup", from, shutdown, move || {
                            self.repository.missing_heights(from, to)
                        })
                        .await
                    else {
                        return Ok(());
                    };
                    tracing::debug!(from, to, missing = missing.len(), "missing heights found");
                    for height in missing {
                        if !self.enqueue(queue, WorkItem::new(height), shutdown).await {
                            return Ok(());
                        }
                    }
                    next = to.saturating_add(1);
                }
                BackfillStrategy::Force => {
                    if !self
                        .enqueue(queue, WorkItem::new(next).forced(), shutdown)
                        .await
                    {
                        return Ok(());
                    }
                    next += 1;
                }
                BackfillStrategy::SkipExisting => {
                    let height = next;
                    let Some(exists) = self
                        .retrying("block existence check", height, shutdown, move || {
                            self.repository.has_block(height)
                        })
                        .await
                    else {
                        return Ok(());
                    };
                    if !exists && !self.enqueue(queue, WorkItem::new(height), shutdown).await {
                        return Ok(());
                    }
                    next += 1;
                }
            }
        }
    }

    /// Current upper bound; `None` once cancelled.
    async fn resolve_end(&self, shutdown: &CancellationToken) -> Option<u64> {
        match self.target {
            BackfillTarget::Height(end) => Some(end),
            BackfillTarget::ChainHead => {
                self.retrying("chain head lookup", self.start, shutdown, move || {
                    self.source.latest_height()
                })
                .await
            }
        }
    }

    /// Pushes `item`, returning `false` if the run must stop.
    async fn enqueue(&self, queue: &HeightQueue, item: WorkItem, shutdown: &CancellationToken) -> bool {
        let height = item.height;
        tokio::select! {
            _ = shutdown.cancelled() => false,
            pushed = queue.push(item) => match pushed {
                Ok(()) => {
                    self.telemetry.record_enqueued();
                    tracing::trace!(height, "height enqueued");
                    true
                }
                Err(err) => {
                    tracing::debug!(height, error = %err, "queue closed; stopping backfill");
                    false
                }
            }
        }
    }

    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        height: u64,
        shutdown: &CancellationToken,
        mut attempt: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return None,
                result = attempt() => result,
            };

            match result {
                Ok(value) => return Some(value),
                Err(err) => {
                    tracing::warn!(
                        height,
                        operation,
                        error = %err,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "backfill lookup failed; retrying same height"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }
}

impl Enqueuer for BackfillEnqueuer {
    fn run(&self, queue: Arc<HeightQueue>, shutdown: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.scan(&queue, &shutdown).await })
    }
}
