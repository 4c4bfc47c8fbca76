//! Built-in module trimming fine-grained rows of old heights.

use super::registry::ModuleContext;
use super::{Module, PeriodicOperationsModule};
use crate::repository::Repository;
use crate::runtime::config::PruningConfig;
use crate::scheduler::Scheduler;
use anyhow::{bail, Context, Result};
use std::sync::Arc;

/// Result of a single pruning check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// No interval boundary was reached yet or nothing below it is left to prune.
    Skipped,
    /// Heights up to `watermark` were examined; `pruned` of them were deleted.
    Pruned { watermark: u64, pruned: u64 },
}

pub struct PruningModule {
    repository: Arc<dyn Repository>,
    config: PruningConfig,
}

impl PruningModule {
    pub const NAME: &'static str = "pruning";

    /// Fails when the repository cannot prune.
    pub fn new(repository: Arc<dyn Repository>, config: PruningConfig) -> Result<Self> {
        if repository.as_pruning().is_none() {
            bail!("pruning module requires a repository with pruning support");
        }
        Ok(Self { repository, config })
    }

    pub(crate) fn build(ctx: &ModuleContext) -> Result<Arc<dyn Module>> {
        let config = ctx
            .config
            .pruning()
            .cloned()
            .context("pruning module enabled without a pruning configuration")?;
        Ok(Arc::new(Self::new(ctx.repository.clone(), config)?))
    }

    pub async fn prune_once(&self) -> Result<PruneOutcome> {
        prune_old_heights(self.repository.as_ref(), &self.config).await
    }
}

impl Module for PruningModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_periodic_operations(&self) -> Option<&dyn PeriodicOperationsModule> {
        Some(self)
    }
}

impl PeriodicOperationsModule for PruningModule {
    fn register_periodic(&self, scheduler: &mut Scheduler) -> Result<()> {
        let repository = self.repository.clone();
        let config = self.config.clone();
        scheduler.every(Self::NAME, config.check_interval(), move || {
            let repository = repository.clone();
            let config = config.clone();
            Box::pin(async move {
                prune_old_heights(repository.as_ref(), &config)
                    .await
                    .map(|_| ())
            })
        })
    }
}

/// Prunes every height in `(watermark, boundary - keep_recent]` that is not a
/// multiple of `keep_every`, then advances the watermark. `boundary` is the
/// last multiple of `interval` at or below the last stored height, so a check
/// that misses the exact boundary still prunes once it is crossed.
///
/// The range stops below the first height without a block row: rows of a
/// height backfilled later must not land behind the watermark. A failure
/// leaves the watermark untouched, so the next run starts over from the same
/// point.
async fn prune_old_heights(repository: &dyn Repository, config: &PruningConfig) -> Result<PruneOutcome> {
    let current = repository
        .last_block_height()
        .await
        .context("failed to read last stored height")?;
    let boundary = current - current % config.interval();
    let Some(target) = boundary.checked_sub(config.keep_recent()) else {
        return Ok(PruneOutcome::Skipped);
    };

    let store = repository
        .as_pruning()
        .context("repository lost its pruning capability")?;
    let watermark = store
        .last_pruned()
        .await
        .context("failed to read pruning watermark")?;
    if watermark >= target {
        return Ok(PruneOutcome::Skipped);
    }

    let from = watermark.saturating_add(1);
    let missing = repository
        .missing_heights(from, target)
        .await
        .with_context(|| format!("failed to look for gaps in {from}..={target}"))?;
    let limit = match missing.first() {
        Some(&gap) => {
            tracing::debug!(
                module = PruningModule::NAME,
                gap,
                target,
                "pruning held back by a height not indexed yet"
            );
            gap - 1
        }
        None => target,
    };
    if watermark >= limit {
        return Ok(PruneOutcome::Skipped);
    }

    let mut pruned = 0u64;
    for height in from..=limit {
        if height % config.keep_every() == 0 {
            continue;
        }
        store
            .prune(height)
            .await
            .with_context(|| format!("failed to prune height {height}"))?;
        pruned += 1;
    }

    store
        .store_last_pruned(limit)
        .await
        .with_context(|| format!("failed to store pruning watermark {limit}"))?;

    tracing::info!(
        module = PruningModule::NAME,
        current,
        watermark = limit,
        pruned,
        "pruned old heights"
    );

    Ok(PruneOutcome::Pruned {
        watermark: limit,
        pruned,
    })
}
