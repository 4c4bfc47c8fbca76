//! Bootstrap path that snapshots module state at the chain head instead of
//! replaying history.

use crate::modules::{ModuleError, ModuleStage, Modules};
use crate::runtime::telemetry::Telemetry;
use crate::source::Source;
use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastSyncReport {
    pub height: u64,
    /// Modules whose `download_state` was invoked, in order.
    pub synced: Vec<String>,
    /// Subset of `synced` that returned an error.
    pub failed: Vec<String>,
}

/// Reads the current head once and asks every fast-sync capable module to
/// download its state at that height.
///
/// Module failures are logged and do not stop later modules; only failing
/// to read the head height is an error.
pub async fn fast_sync(
    source: &dyn Source,
    modules: &Modules,
    telemetry: &Telemetry,
) -> Result<FastSyncReport> {
    let height = source
        .latest_height()
        .await
        .context("failed to read chain head for fast sync")?;

    tracing::info!(height, "fast sync started");

    let mut report = FastSyncReport {
        height,
        synced: Vec::new(),
        failed: Vec::new(),
    };

    for module in modules.iter() {
        let Some(handler) = module.as_fast_sync() else {
            continue;
        };
        report.synced.push(module.name().to_owned());

        if let Err(err) = handler.download_state(height).await {
            let err = ModuleError::new(module.name(), ModuleStage::FastSync, err);
            tracing::error!(
                module = module.name(),
                height,
                error = %err,
                "module failed to download state"
            );
            telemetry.record_module_error();
            report.failed.push(module.name().to_owned());
        }
    }

    tracing::info!(
        height,
        modules = report.synced.len(),
        failed = report.failed.len(),
        "fast sync finished"
    );

    Ok(report)
}
