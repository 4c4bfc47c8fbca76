//! Extension modules and the capability contracts they may implement.
//!
//! A module advertises a name and answers capability queries (`as_block`,
//! `as_message`, ...). The pipeline asks every module for every capability
//! independently, so a module implements exactly the subset it needs.

pub mod dispatch;
pub mod messages;
pub mod pruning;
pub mod registry;

use crate::scheduler::Scheduler;
use crate::types::{Block, GenesisDoc, Message, Transaction, ValidatorSet};
use anyhow::{Error as AnyError, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use dispatch::ModuleDispatcher;
pub use registry::{ModuleContext, ModuleFactory, ModuleRegistry};

pub type ModuleFuture<'a> = BoxFuture<'a, Result<()>>;

/// Pipeline stage a module handler was invoked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStage {
    RunOnce,
    RunAsync,
    Periodic,
    FastSync,
    Genesis,
    Block,
    Transaction,
    Message,
    AuthzMessage,
}

/// Failure raised by a module handler, tagged with the module and stage.
#[derive(Debug)]
pub struct ModuleError {
    module: String,
    stage: ModuleStage,
    source: AnyError,
}

impl ModuleError {
    pub fn new(module: impl Into<String>, stage: ModuleStage, source: AnyError) -> Self {
        Self {
            module: module.into(),
            stage,
            source,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn stage(&self) -> ModuleStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "module {} failed during {:?}: {:#}",
            self.module, self.stage, self.source
        )
    }
}

impl std::error::Error for ModuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// A named extension observing the indexed chain.
///
/// Modules are built once at startup and shared across every worker, so
/// handlers take `&self` and must be safe to call concurrently.
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn as_additional_operations(&self) -> Option<&dyn AdditionalOperationsModule> {
        None
    }

    fn as_async_operations(&self) -> Option<&dyn AsyncOperationsModule> {
        None
    }

    fn as_periodic_operations(&self) -> Option<&dyn PeriodicOperationsModule> {
        None
    }

    fn as_fast_sync(&self) -> Option<&dyn FastSyncModule> {
        None
    }

    fn as_genesis(&self) -> Option<&dyn GenesisModule> {
        None
    }

    fn as_block(&self) -> Option<&dyn BlockModule> {
        None
    }

    fn as_transaction(&self) -> Option<&dyn TransactionModule> {
        None
    }

    fn as_message(&self) -> Option<&dyn MessageModule> {
        None
    }

    fn as_authz_message(&self) -> Option<&dyn AuthzMessageModule> {
        None
    }
}

/// Runs exactly once before the pipeline starts. An error aborts startup.
pub trait AdditionalOperationsModule: Send + Sync {
    fn run_once(&self) -> ModuleFuture<'_>;
}

/// Long-running task spawned at startup.
///
/// The returned future must only resolve on shutdown (`Ok`) or on an
/// unrecoverable failure, which stops the whole pipeline.
pub trait AsyncOperationsModule: Send + Sync {
    fn run_async(&self, shutdown: CancellationToken) -> BoxFuture<'static, Result<()>>;
}

pub trait PeriodicOperationsModule: Send + Sync {
    fn register_periodic(&self, scheduler: &mut Scheduler) -> Result<()>;
}

/// Snapshots module state at `height` instead of replaying history.
pub trait FastSyncModule: Send + Sync {
    fn download_state(&self, height: u64) -> ModuleFuture<'_>;
}

pub trait GenesisModule: Send + Sync {
    fn handle_genesis<'a>(&'a self, doc: &'a GenesisDoc, app_state: &'a Value)
        -> ModuleFuture<'a>;
}

/// Invoked once per block after its core records are stored.
pub trait BlockModule: Send + Sync {
    fn handle_block<'a>(
        &'a self,
        block: &'a Block,
        txs: &'a [Transaction],
        validators: &'a ValidatorSet,
    ) -> ModuleFuture<'a>;
}

pub trait TransactionModule: Send + Sync {
    fn handle_tx<'a>(&'a self, tx: &'a Transaction) -> ModuleFuture<'a>;
}

/// Invoked once per top-level message, exec wrappers included.
pub trait MessageModule: Send + Sync {
    fn handle_msg<'a>(
        &'a self,
        index: usize,
        msg: &'a Message,
        tx: &'a Transaction,
    ) -> ModuleFuture<'a>;
}

/// Invoked once per message nested inside an exec wrapper.
///
/// `index` is the position of the top-level message inside the transaction,
/// `inner_index` the position of `inner` inside `wrapper`.
pub trait AuthzMessageModule: Send + Sync {
    fn handle_msg_exec<'a>(
        &'a self,
        index: usize,
        wrapper: &'a Message,
        inner_index: usize,
        inner: &'a Message,
        tx: &'a Transaction,
    ) -> ModuleFuture<'a>;
}

/// Active modules in registration order.
#[derive(Clone, Default)]
pub struct Modules {
    entries: Vec<Arc<dyn Module>>,
}

impl Modules {
    pub fn new(entries: Vec<Arc<dyn Module>>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Module>> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|module| module.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Modules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
