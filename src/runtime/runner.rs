use crate::indexer::Indexer;
use crate::modules::ModuleRegistry;
use crate::repository::Repository;
use crate::runtime::config::IndexerConfig;
use crate::source::Source;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the indexer lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner {
    indexer: Indexer,
    shutdown: CancellationToken,
    started: bool,
}

impl Runner {
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the entire pipeline (producers, workers, modules).
    pub fn new(
        config: IndexerConfig,
        source: Arc<dyn Source>,
        repository: Arc<dyn Repository>,
        registry: &ModuleRegistry,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let indexer =
            Indexer::with_cancellation_token(config, source, repository, registry, shutdown.clone())?;
        Ok(Self {
            indexer,
            shutdown,
            started: false,
        })
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    /// Starts the underlying pipeline.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.indexer.start().await?;
        self.started = true;
        Ok(())
    }

    /// Stops the pipeline gracefully by cancelling the root token and delegating to the indexer.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        let result = self.indexer.stop().await;
        self.started = false;
        self.reinitialize_shutdown_token();
        result
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere,
    /// including by a fatal pipeline error.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.indexer.replace_shutdown_root(self.shutdown.clone());
    }
}
