//! Indexing pipeline orchestration.
//!
//! `Indexer` wires the pieces owned by other modules:
//! - `queue` buffers heights between producers and workers.
//! - `enqueuer` hosts the backfill and live producers.
//! - `worker` drains the queue and dispatches to modules.
//! - `fastsync` replaces the backfill when configured.
//! - `lifecycle` holds run-scoped cancellation, telemetry reporting and fatal
//!   error propagation.

mod lifecycle;

use lifecycle::{join_with_timeout, LifecycleHandles, LifecycleSpawnParams};

use crate::enqueuer::{BackfillEnqueuer, BackfillStrategy, BackfillTarget, Enqueuer, LiveEnqueuer};
use crate::fastsync::{self, FastSyncReport};
use crate::modules::{ModuleContext, ModuleDispatcher, ModuleError, ModuleRegistry, ModuleStage, Modules};
use crate::queue::HeightQueue;
use crate::repository::Repository;
use crate::runtime::config::IndexerConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::Scheduler;
use crate::source::Source;
use crate::types::GenesisDoc;
use crate::worker::{WorkerPool, WorkerShared};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Re-processing run over a fixed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRequest {
    pub start: u64,
    /// Last height to replay; `None` uses the chain head at the time of the call.
    pub end: Option<u64>,
    pub strategy: BackfillStrategy,
}

impl ReplayRequest {
    /// Re-indexes every height in `[start, end]`, stored or not.
    pub fn force(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
            strategy: BackfillStrategy::Force,
        }
    }

    /// Indexes the heights from `start` that the repository does not have.
    pub fn missing(start: u64, end: Option<u64>) -> Self {
        Self {
            start,
            end,
            strategy: BackfillStrategy::Missing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub start: u64,
    pub end: u64,
    /// Heights written during the replay.
    pub indexed: u64,
}

pub struct Indexer {
    config: IndexerConfig,
    source: Arc<dyn Source>,
    repository: Arc<dyn Repository>,
    modules: Modules,
    queue: Arc<HeightQueue>,
    telemetry: Arc<Telemetry>,
    progress: Arc<ProgressTracker>,
    shutdown_root: CancellationToken,
    lifecycle: Option<LifecycleHandles>,
    pool: Option<WorkerPool>,
    fast_sync_report: Option<FastSyncReport>,
    running: bool,
}

impl Indexer {
    /// Builds the indexer and instantiates the configured modules.
    ///
    /// Fails when a module is unknown or refuses the given collaborators
    /// (for example pruning against a store that cannot prune).
    pub fn new(
        config: IndexerConfig,
        source: Arc<dyn Source>,
        repository: Arc<dyn Repository>,
        registry: &ModuleRegistry,
    ) -> Result<Self> {
        Self::with_cancellation_token(config, source, repository, registry, CancellationToken::new())
    }

    /// Same as [`Self::new`] with an externally owned root shutdown token.
    pub fn with_cancellation_token(
        config: IndexerConfig,
        source: Arc<dyn Source>,
        repository: Arc<dyn Repository>,
        registry: &ModuleRegistry,
        shutdown_token: CancellationToken,
    ) -> Result<Self> {
        config.validate().context("invalid indexer configuration")?;

        let ctx = ModuleContext {
            source: source.clone(),
            repository: repository.clone(),
            config: config.clone(),
        };
        let modules = registry
            .build(config.modules(), &ctx)
            .context("failed to build modules")?;

        tracing::info!(modules = ?modules, "modules loaded");

        Ok(Self {
            queue: Arc::new(HeightQueue::with_capacity(config.queue_capacity())),
            config,
            source,
            repository,
            modules,
            telemetry: Arc::new(Telemetry::default()),
            progress: Arc::new(ProgressTracker::new()),
            shutdown_root: shutdown_token,
            lifecycle: None,
            pool: None,
            fast_sync_report: None,
            running: false,
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn modules(&self) -> &Modules {
        &self.modules
    }

    pub fn queue(&self) -> &Arc<HeightQueue> {
        &self.queue
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Highest height indexed since the last start; `None` if nothing was indexed.
    pub fn last_indexed_height(&self) -> Option<u64> {
        self.progress.highest_indexed()
    }

    /// Outcome of the fast sync run by the last `start`, if any.
    pub fn fast_sync_report(&self) -> Option<&FastSyncReport> {
        self.fast_sync_report.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the indexer is idle (between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the indexer is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Starts the pipeline.
    ///
    /// Setup failures (unreachable source or repository, a failing `run_once`,
    /// an unreadable genesis) are returned and leave nothing running.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            bail!("indexer already running");
        }

        let head = self
            .source
            .latest_height()
            .await
            .context("source is unreachable")?;
        let stored = self
            .repository
            .last_block_height()
            .await
            .context("repository is unreachable")?;

        tracing::info!(
            head,
            stored,
            workers = self.config.workers(),
            fast_sync = self.config.fast_sync(),
            "starting indexer"
        );

        let mut lifecycle = self.begin_run().await;
        let fatal_handler = lifecycle.fatal_handler();
        let run_token = lifecycle.run_token.clone();

        if let Err(err) = self.setup(&mut lifecycle, &run_token, &fatal_handler).await {
            self.abort_run(lifecycle).await;
            return Err(err);
        }

        let mut pool = WorkerPool::new(self.config.workers(), self.worker_shared());
        pool.launch(run_token.clone(), fatal_handler.clone());
        self.pool = Some(pool);

        self.fast_sync_report = None;
        if self.config.fast_sync() {
            let report = match fastsync::fast_sync(
                self.source.as_ref(),
                &self.modules,
                &self.telemetry,
            )
            .await
            {
                Ok(report) => report,
                Err(err) => {
                    self.abort_run(lifecycle).await;
                    return Err(err);
                }
            };
            self.fast_sync_report = Some(report);
        } else if self.config.parse_old_blocks() {
            let backfill = BackfillEnqueuer::from_config(
                &self.config,
                self.source.clone(),
                self.repository.clone(),
                self.telemetry.clone(),
            );
            let handle = self.spawn_enqueuer("backfill", backfill, &run_token, &fatal_handler);
            lifecycle.track("backfill enqueuer", handle);
        }

        if self.config.parse_new_blocks() {
            let live = LiveEnqueuer::new(self.source.clone(), self.telemetry.clone());
            let handle = self.spawn_enqueuer("live", live, &run_token, &fatal_handler);
            lifecycle.track("live enqueuer", handle);
        }

        self.lifecycle = Some(lifecycle);
        self.running = true;

        Ok(())
    }

    /// Stops the pipeline.
    ///
    /// Workers finish the item they hold; everything is joined up to the
    /// configured shutdown timeout, after which remaining tasks are aborted.
    /// The source and repository are closed last. A fatal error captured
    /// during the run is returned here.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("stopping indexer");

        let lifecycle_error = self.lifecycle.as_ref().and_then(|handles| handles.error());
        if let Some(lifecycle) = self.lifecycle.take() {
            self.end_run(lifecycle).await;
        }
        tracing::debug!("indexer stop: run tasks joined");

        self.running = false;
        let close_result = self.close().await;

        if let Some(err) = lifecycle_error {
            if let Err(close_err) = close_result {
                tracing::warn!(error = %close_err, "failed to close collaborators after fatal error");
            }
            return Err(err).context("indexing pipeline aborted");
        }

        close_result
    }

    /// Re-processes a height range and returns once every height has been
    /// handled.
    ///
    /// Must not be called while the pipeline is running. Source and
    /// repository stay open; call [`Self::close`] when done with them.
    pub async fn replay(&mut self, request: ReplayRequest) -> Result<ReplayReport> {
        if self.running {
            bail!("cannot replay while the indexer is running");
        }
        if request.start == 0 {
            bail!("replay start height must be at least 1");
        }

        let end = match request.end {
            Some(end) => end,
            None => self
                .source
                .latest_height()
                .await
                .context("failed to read chain head for replay")?,
        };
        if end < request.start {
            bail!("replay end height ({end}) is below start height ({})", request.start);
        }

        tracing::info!(
            start = request.start,
            end,
            strategy = ?request.strategy,
            "replaying heights"
        );

        let indexed_before = self.telemetry.indexed_heights();
        let lifecycle = self.begin_run().await;
        let fatal_handler = lifecycle.fatal_handler();
        let run_token = lifecycle.run_token.clone();

        let mut pool = WorkerPool::new(self.config.workers(), self.worker_shared());
        pool.launch(run_token.clone(), fatal_handler.clone());
        self.pool = Some(pool);

        let backfill = BackfillEnqueuer::new(
            self.source.clone(),
            self.repository.clone(),
            self.telemetry.clone(),
            request.start,
            BackfillTarget::Height(end),
        )
        .with_strategy(request.strategy)
        .with_retry_delay(self.config.backfill_retry_delay());

        let enqueued = backfill.run(self.queue.clone(), run_token.clone()).await;
        if enqueued.is_ok() {
            tokio::select! {
                _ = run_token.cancelled() => {}
                _ = self.queue.wait_until_drained() => {}
            }
        }

        let cancelled = run_token.is_cancelled();
        let fatal = lifecycle.error();
        self.end_run(lifecycle).await;

        if let Some(err) = fatal {
            return Err(err).context("indexing pipeline aborted");
        }
        enqueued.context("replay backfill failed")?;
        if cancelled {
            bail!("replay cancelled before completion");
        }

        let report = ReplayReport {
            start: request.start,
            end,
            indexed: self.telemetry.indexed_heights() - indexed_before,
        };
        tracing::info!(
            start = report.start,
            end = report.end,
            indexed = report.indexed,
            "replay finished"
        );
        Ok(report)
    }

    /// Shuts the source down and closes the repository.
    pub async fn close(&self) -> Result<()> {
        let source = self.source.shutdown().await.context("failed to shut down source");
        let repository = self
            .repository
            .close()
            .await
            .context("failed to close repository");
        source.and(repository)
    }

    async fn begin_run(&mut self) -> LifecycleHandles {
        self.queue.reopen().await;
        self.progress.reset();
        LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &self.shutdown_root,
            telemetry: self.telemetry.clone(),
            queue: self.queue.clone(),
            metrics_interval: self.config.metrics_interval(),
        })
    }

    /// Cancels the run, releases the queue and joins workers and tasks.
    async fn end_run(&mut self, mut lifecycle: LifecycleHandles) {
        let timeout = self.config.shutdown_timeout();
        lifecycle.run_token.cancel();
        self.queue.close().await;

        if let Some(mut pool) = self.pool.take() {
            let handles = pool
                .take_handles()
                .into_iter()
                .enumerate()
                .map(|(id, handle)| (format!("worker {id}"), handle))
                .collect();
            join_with_timeout("worker", handles, timeout).await;
        }
        lifecycle.join_tasks(timeout).await;
        lifecycle.shutdown().await;
    }

    async fn abort_run(&mut self, lifecycle: LifecycleHandles) {
        self.end_run(lifecycle).await;
        self.running = false;
    }

    async fn setup(
        &self,
        lifecycle: &mut LifecycleHandles,
        run_token: &CancellationToken,
        fatal_handler: &Arc<FatalErrorHandler>,
    ) -> Result<()> {
        for module in self.modules.iter() {
            if let Some(handler) = module.as_additional_operations() {
                handler
                    .run_once()
                    .await
                    .map_err(|err| ModuleError::new(module.name(), ModuleStage::RunOnce, err))?;
                tracing::debug!(module = module.name(), "run-once operations completed");
            }
        }

        if self.config.parse_genesis() {
            let doc = self.load_genesis().await?;
            tracing::info!(chain_id = %doc.chain_id, "dispatching genesis");
            self.dispatcher().dispatch_genesis(&doc, &doc.app_state).await;
        }

        for module in self.modules.iter() {
            let Some(handler) = module.as_async_operations() else {
                continue;
            };
            let name = module.name().to_owned();
            let future = handler.run_async(run_token.clone());
            let fatal_handler = fatal_handler.clone();
            let module_name = name.clone();
            let handle = tokio::spawn(async move {
                match future.await {
                    Ok(()) => {
                        tracing::debug!(module = %module_name, "async operations returned");
                    }
                    Err(err) => {
                        let err = ModuleError::new(module_name.as_str(), ModuleStage::RunAsync, err);
                        let context = format!("async module {module_name} failed");
                        fatal_handler.trigger(context.as_str(), err.into());
                    }
                }
            });
            lifecycle.track(format!("async module {name}"), handle);
        }

        let mut scheduler = Scheduler::new();
        for module in self.modules.iter() {
            if let Some(handler) = module.as_periodic_operations() {
                handler
                    .register_periodic(&mut scheduler)
                    .map_err(|err| ModuleError::new(module.name(), ModuleStage::Periodic, err))?;
            }
        }
        let jobs: Vec<String> = scheduler.job_names().map(str::to_owned).collect();
        for (name, handle) in jobs.into_iter().zip(scheduler.start(run_token.clone())) {
            lifecycle.track(format!("periodic job {name}"), handle);
        }

        Ok(())
    }

    async fn load_genesis(&self) -> Result<GenesisDoc> {
        match self.config.genesis_file() {
            Some(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read genesis file {}", path.display()))?;
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to parse genesis file {}", path.display()))
            }
            None => self
                .source
                .genesis()
                .await
                .context("failed to fetch genesis from source"),
        }
    }

    fn spawn_enqueuer<E: Enqueuer + 'static>(
        &self,
        name: &'static str,
        enqueuer: E,
        run_token: &CancellationToken,
        fatal_handler: &Arc<FatalErrorHandler>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let shutdown = run_token.clone();
        let fatal_handler = fatal_handler.clone();
        tokio::spawn(async move {
            match enqueuer.run(queue, shutdown.clone()).await {
                Ok(()) => tracing::debug!(enqueuer = name, "enqueuer finished"),
                Err(err) if shutdown.is_cancelled() => {
                    tracing::debug!(enqueuer = name, error = %err, "enqueuer stopped during shutdown");
                }
                Err(err) => {
                    let context = format!("{name} enqueuer failed");
                    fatal_handler.trigger(context.as_str(), err);
                }
            }
        })
    }

    fn dispatcher(&self) -> ModuleDispatcher {
        ModuleDispatcher::new(self.modules.clone(), self.telemetry.clone())
    }

    fn worker_shared(&self) -> WorkerShared {
        WorkerShared {
            source: self.source.clone(),
            repository: self.repository.clone(),
            queue: self.queue.clone(),
            dispatcher: self.dispatcher(),
            telemetry: self.telemetry.clone(),
            progress: self.progress.clone(),
            max_attempts: self.config.max_attempts(),
        }
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.run_token.cancel();
        }
    }
}
