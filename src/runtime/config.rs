use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BACKFILL_RETRY_DELAY_SECS: u64 = 2;
const DEFAULT_HEAD_REFRESH_INTERVAL_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PRUNING_CHECK_INTERVAL_SECS: u64 = 10;

/// Runtime configuration for the indexing pipeline.
///
/// All instances must be constructed via [`IndexerConfig::builder`] or [`IndexerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    workers: usize,
    queue_capacity: usize,
    start_height: u64,
    end_height: Option<u64>,
    parse_old_blocks: bool,
    parse_new_blocks: bool,
    fast_sync: bool,
    parse_genesis: bool,
    genesis_file: Option<PathBuf>,
    backfill_retry_delay: Duration,
    head_refresh_interval: Duration,
    metrics_interval: Duration,
    shutdown_timeout: Duration,
    max_attempts: Option<usize>,
    modules: Vec<String>,
    pruning: Option<PruningConfig>,
}

pub struct IndexerConfigParams {
    pub workers: usize,
    pub queue_capacity: usize,
    pub start_height: u64,
    pub end_height: Option<u64>,
    pub parse_old_blocks: bool,
    pub parse_new_blocks: bool,
    pub fast_sync: bool,
    pub parse_genesis: bool,
    pub genesis_file: Option<PathBuf>,
    pub backfill_retry_delay: Duration,
    pub head_refresh_interval: Duration,
    pub metrics_interval: Duration,
    pub shutdown_timeout: Duration,
    pub max_attempts: Option<usize>,
    pub modules: Vec<String>,
    pub pruning: Option<PruningConfig>,
}

impl IndexerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: IndexerConfigParams) -> Result<Self> {
        let IndexerConfigParams {
            workers,
            queue_capacity,
            start_height,
            end_height,
            parse_old_blocks,
            parse_new_blocks,
            fast_sync,
            parse_genesis,
            genesis_file,
            backfill_retry_delay,
            head_refresh_interval,
            metrics_interval,
            shutdown_timeout,
            max_attempts,
            modules,
            pruning,
        } = params;

        let config = Self {
            workers,
            queue_capacity,
            start_height,
            end_height,
            parse_old_blocks,
            parse_new_blocks,
            fast_sync,
            parse_genesis,
            genesis_file,
            backfill_retry_delay,
            head_refresh_interval,
            metrics_interval,
            shutdown_timeout,
            max_attempts,
            modules: modules
                .into_iter()
                .map(|name| name.trim().to_owned())
                .collect(),
            pruning,
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of concurrent workers draining the queue.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Maximum number of pending work items.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// First height the backfill enqueuer considers.
    pub fn start_height(&self) -> u64 {
        self.start_height
    }

    /// Last height to backfill; `None` keeps up with the chain head.
    pub fn end_height(&self) -> Option<u64> {
        self.end_height
    }

    /// Whether historical heights are backfilled at startup.
    pub fn parse_old_blocks(&self) -> bool {
        self.parse_old_blocks
    }

    /// Whether new blocks are followed through the source subscription.
    pub fn parse_new_blocks(&self) -> bool {
        self.parse_new_blocks
    }

    /// Whether modules snapshot state at the head instead of a full backfill.
    pub fn fast_sync(&self) -> bool {
        self.fast_sync
    }

    pub fn parse_genesis(&self) -> bool {
        self.parse_genesis
    }

    /// Local genesis file used instead of asking the source.
    pub fn genesis_file(&self) -> Option<&PathBuf> {
        self.genesis_file.as_ref()
    }

    /// Sleep applied by the backfill enqueuer before retrying a failed height.
    pub fn backfill_retry_delay(&self) -> Duration {
        self.backfill_retry_delay
    }

    /// Interval between chain head refreshes when backfilling up to the head.
    pub fn head_refresh_interval(&self) -> Duration {
        self.head_refresh_interval
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Upper bound on waiting for in-flight work during shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Failed attempts after which a height is dropped; `None` retries forever.
    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    /// Module names in registration order.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn pruning(&self) -> Option<&PruningConfig> {
        self.pruning.as_ref()
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be greater than 0");
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than 0");
        }

        if self.start_height == 0 {
            bail!("start_height must be at least 1");
        }

        if let Some(end) = self.end_height {
            if end < self.start_height {
                bail!(
                    "end_height ({end}) must not be below start_height ({})",
                    self.start_height
                );
            }
        }

        if self.backfill_retry_delay.is_zero() {
            bail!("backfill_retry_delay must be greater than 0");
        }

        if self.head_refresh_interval.is_zero() {
            bail!("head_refresh_interval must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        if self.max_attempts == Some(0) {
            bail!("max_attempts must be greater than 0 when set");
        }

        for (idx, name) in self.modules.iter().enumerate() {
            if name.is_empty() {
                bail!("modules cannot contain empty names");
            }
            if self.modules[..idx].contains(name) {
                bail!("module {name} is listed more than once");
            }
        }

        if let Some(pruning) = &self.pruning {
            pruning.validate()?;
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IndexerConfigBuilder {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    start_height: Option<u64>,
    end_height: Option<u64>,
    parse_old_blocks: Option<bool>,
    parse_new_blocks: Option<bool>,
    fast_sync: Option<bool>,
    parse_genesis: Option<bool>,
    genesis_file: Option<PathBuf>,
    backfill_retry_delay: Option<Duration>,
    head_refresh_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    max_attempts: Option<usize>,
    modules: Vec<String>,
    pruning: Option<PruningConfig>,
}

impl IndexerConfigBuilder {
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn start_height(mut self, height: u64) -> Self {
        self.start_height = Some(height);
        self
    }

    pub fn end_height(mut self, height: u64) -> Self {
        self.end_height = Some(height);
        self
    }

    pub fn parse_old_blocks(mut self, enabled: bool) -> Self {
        self.parse_old_blocks = Some(enabled);
        self
    }

    pub fn parse_new_blocks(mut self, enabled: bool) -> Self {
        self.parse_new_blocks = Some(enabled);
        self
    }

    pub fn fast_sync(mut self, enabled: bool) -> Self {
        self.fast_sync = Some(enabled);
        self
    }

    pub fn parse_genesis(mut self, enabled: bool) -> Self {
        self.parse_genesis = Some(enabled);
        self
    }

    pub fn genesis_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.genesis_file = Some(path.into());
        self
    }

    pub fn backfill_retry_delay(mut self, delay: Duration) -> Self {
        self.backfill_retry_delay = Some(delay);
        self
    }

    pub fn head_refresh_interval(mut self, interval: Duration) -> Self {
        self.head_refresh_interval = Some(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn module(mut self, name: impl Into<String>) -> Self {
        self.modules.push(name.into());
        self
    }

    pub fn modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn pruning(mut self, pruning: PruningConfig) -> Self {
        self.pruning = Some(pruning);
        self
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let params = IndexerConfigParams {
            workers: self.workers.context("workers is required")?,
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            start_height: self.start_height.context("start_height is required")?,
            end_height: self.end_height,
            parse_old_blocks: self.parse_old_blocks.unwrap_or(true),
            parse_new_blocks: self.parse_new_blocks.unwrap_or(true),
            fast_sync: self.fast_sync.unwrap_or(false),
            parse_genesis: self.parse_genesis.unwrap_or(false),
            genesis_file: self.genesis_file,
            backfill_retry_delay: self
                .backfill_retry_delay
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_BACKFILL_RETRY_DELAY_SECS)),
            head_refresh_interval: self
                .head_refresh_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_HEAD_REFRESH_INTERVAL_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            shutdown_timeout: self
                .shutdown_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)),
            max_attempts: self.max_attempts,
            modules: self.modules,
            pruning: self.pruning,
        };

        IndexerConfig::new(params)
    }
}

/// Retention policy applied by the pruning module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruningConfig {
    interval: u64,
    keep_recent: u64,
    keep_every: u64,
    check_interval: Duration,
}

impl PruningConfig {
    /// Prunes every `interval` heights, keeping the `keep_recent` most recent
    /// heights and every multiple of `keep_recent` as a snapshot.
    pub fn new(interval: u64, keep_recent: u64) -> Result<Self> {
        let config = Self {
            interval,
            keep_recent,
            keep_every: keep_recent,
            check_interval: Duration::from_secs(DEFAULT_PRUNING_CHECK_INTERVAL_SECS),
        };
        config.validate()?;
        Ok(config)
    }

    /// Overrides the snapshot spacing (defaults to `keep_recent`).
    pub fn with_keep_every(mut self, keep_every: u64) -> Result<Self> {
        self.keep_every = keep_every;
        self.validate()?;
        Ok(self)
    }

    /// Overrides how often the scheduler checks whether pruning is due.
    pub fn with_check_interval(mut self, interval: Duration) -> Result<Self> {
        self.check_interval = interval;
        self.validate()?;
        Ok(self)
    }

    /// Height spacing between pruning runs.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Number of most recent heights never pruned.
    pub fn keep_recent(&self) -> u64 {
        self.keep_recent
    }

    /// Heights that are multiples of this value are retained forever.
    pub fn keep_every(&self) -> u64 {
        self.keep_every
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            bail!("pruning interval must be greater than 0");
        }
        if self.keep_recent == 0 {
            bail!("pruning keep_recent must be greater than 0");
        }
        if self.keep_every == 0 {
            bail!("pruning keep_every must be greater than 0");
        }
        if self.check_interval.is_zero() {
            bail!("pruning check_interval must be greater than 0");
        }
        Ok(())
    }
}
