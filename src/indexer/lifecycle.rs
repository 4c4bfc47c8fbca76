//! Lifecycle orchestration for `Indexer`.

use crate::queue::HeightQueue;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, Telemetry};
use anyhow::Error;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run-scoped tasks and cancellation shared by one `start`/`stop` cycle.
pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
    metrics_handle: Option<JoinHandle<()>>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub queue: Arc<HeightQueue>,
    pub metrics_interval: Duration,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> Self {
        let LifecycleSpawnParams {
            shutdown_root,
            telemetry,
            queue,
            metrics_interval,
        } = params;

        let run_token = shutdown_root.child_token();
        let fatal_handler = Arc::new(FatalErrorHandler::new(
            shutdown_root.clone(),
            run_token.clone(),
        ));
        let metrics_handle = telemetry::spawn_metrics_reporter(
            telemetry,
            queue,
            run_token.clone(),
            metrics_interval,
        );

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
            tasks: Vec::new(),
        }
    }

    pub(crate) fn fatal_handler(&self) -> Arc<FatalErrorHandler> {
        self.fatal_handler.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    /// Tracks a run-scoped task so shutdown can join it.
    pub(crate) fn track(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.push((name.into(), handle));
    }

    /// Joins tracked tasks, aborting whatever is still running after `timeout`.
    pub(crate) async fn join_tasks(&mut self, timeout: Duration) {
        join_with_timeout("task", std::mem::take(&mut self.tasks), timeout).await;
    }

    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}

/// Waits for every handle up to `timeout`, then aborts the stragglers.
pub(crate) async fn join_with_timeout(
    kind: &str,
    handles: Vec<(String, JoinHandle<()>)>,
    timeout: Duration,
) {
    if handles.is_empty() {
        return;
    }

    let aborts: Vec<_> = handles
        .iter()
        .map(|(name, handle)| (name.clone(), handle.abort_handle()))
        .collect();
    let joined = join_all(handles.into_iter().map(|(name, handle)| async move {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                tracing::warn!(task = %name, error = %err, "task terminated unexpectedly");
            }
        }
    }));

    if tokio::time::timeout(timeout, joined).await.is_err() {
        for (name, abort) in aborts {
            if !abort.is_finished() {
                tracing::warn!(
                    kind,
                    task = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "task did not stop before the shutdown timeout; aborting"
                );
                abort.abort();
            }
        }
    }
}
