//! Worker pool orchestration for the `Indexer`.

use super::{Worker, WorkerShared};
use crate::runtime::fatal::FatalErrorHandler;
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    size: usize,
    shared: WorkerShared,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, shared: WorkerShared) -> Self {
        Self {
            size: size.max(1),
            shared,
            workers: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|handle| !handle.is_finished())
    }

    /// Spawns `size` workers. A worker that returns an error or panics
    /// reports through `fatal_handler`, which stops the whole run.
    pub fn launch(&mut self, run_token: CancellationToken, fatal_handler: Arc<FatalErrorHandler>) {
        self.workers.clear();

        for worker_id in 0..self.size {
            let worker = Worker::new(worker_id, self.shared.clone(), run_token.clone());
            let fatal_handler = fatal_handler.clone();

            let handle = tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(
                            worker = worker_id,
                            error = %err,
                            "worker task exited with error"
                        );
                        let context = format!("worker {worker_id} exited with error");
                        fatal_handler.trigger(context.as_str(), err);
                    }
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(
                            worker = worker_id,
                            panic = %panic_msg,
                            "worker task panicked"
                        );
                        let context = format!("worker {worker_id} panicked");
                        let panic_error =
                            anyhow::anyhow!("worker {worker_id} panicked: {panic_msg}");
                        fatal_handler.trigger(context.as_str(), panic_error);
                    }
                }
            });

            self.workers.push(handle);
        }

        self.shared.telemetry.record_worker_pool_size(self.size);
        tracing::info!(workers = self.size, "worker pool started");
    }

    /// Hands the worker handles over so the caller can join them.
    pub fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        self.shared.telemetry.record_worker_pool_size(0);
        std::mem::take(&mut self.workers)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
