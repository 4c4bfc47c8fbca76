use super::{ModuleError, ModuleStage, Modules};
use crate::runtime::telemetry::Telemetry;
use crate::types::{Block, GenesisDoc, Message, Transaction, ValidatorSet};
use anyhow::Error as AnyError;
use serde_json::Value;
use std::sync::Arc;

/// Fans pipeline events out to every module implementing the matching
/// capability.
///
/// Handler failures are logged and counted; they never stop the remaining
/// modules or the remaining transactions and messages of the block.
#[derive(Clone)]
pub struct ModuleDispatcher {
    modules: Modules,
    telemetry: Arc<Telemetry>,
}

impl ModuleDispatcher {
    pub fn new(modules: Modules, telemetry: Arc<Telemetry>) -> Self {
        Self { modules, telemetry }
    }

    pub fn modules(&self) -> &Modules {
        &self.modules
    }

    pub async fn dispatch_genesis(&self, doc: &GenesisDoc, app_state: &Value) {
        for module in self.modules.iter() {
            let Some(handler) = module.as_genesis() else {
                continue;
            };
            if let Err(err) = handler.handle_genesis(doc, app_state).await {
                let err = ModuleError::new(module.name(), ModuleStage::Genesis, err);
                tracing::error!(
                    module = module.name(),
                    chain_id = %doc.chain_id,
                    error = %err,
                    "module failed to handle genesis"
                );
                self.telemetry.record_module_error();
            }
        }
    }

    /// Dispatches a stored block: block handlers, then every transaction,
    /// then every message (each exec wrapper followed by its nested messages).
    pub async fn dispatch_block(&self, block: &Block, txs: &[Transaction], validators: &ValidatorSet) {
        for module in self.modules.iter() {
            let Some(handler) = module.as_block() else {
                continue;
            };
            if let Err(err) = handler.handle_block(block, txs, validators).await {
                self.block_error(module.name(), block.height, err);
            }
        }

        for tx in txs {
            self.dispatch_tx(tx).await;
        }

        for tx in txs {
            for (index, msg) in tx.messages.iter().enumerate() {
                self.dispatch_msg(index, msg, tx).await;
            }
        }
    }

    async fn dispatch_tx(&self, tx: &Transaction) {
        for module in self.modules.iter() {
            let Some(handler) = module.as_transaction() else {
                continue;
            };
            if let Err(err) = handler.handle_tx(tx).await {
                let err = ModuleError::new(module.name(), ModuleStage::Transaction, err);
                tracing::error!(
                    module = module.name(),
                    height = tx.height,
                    tx_hash = %tx.hash,
                    error = %err,
                    "module failed to handle transaction"
                );
                self.telemetry.record_module_error();
            }
        }
    }

    async fn dispatch_msg(&self, index: usize, msg: &Message, tx: &Transaction) {
        for module in self.modules.iter() {
            let Some(handler) = module.as_message() else {
                continue;
            };
            if let Err(err) = handler.handle_msg(index, msg, tx).await {
                let err = ModuleError::new(module.name(), ModuleStage::Message, err);
                tracing::error!(
                    module = module.name(),
                    height = tx.height,
                    tx_hash = %tx.hash,
                    msg_type = msg.type_url(),
                    msg_index = index,
                    error = %err,
                    "module failed to handle message"
                );
                self.telemetry.record_module_error();
            }
        }

        self.dispatch_exec(index, msg, tx).await;
    }

    /// Walks exec wrappers depth first: a nested wrapper is dispatched as an
    /// inner message, then its own children, before its next sibling.
    async fn dispatch_exec(&self, index: usize, wrapper: &Message, tx: &Transaction) {
        let mut stack = vec![(wrapper, wrapper.inner().iter().enumerate())];
        while let Some((parent, children)) = stack.last_mut() {
            let parent = *parent;
            let Some((inner_index, inner)) = children.next() else {
                stack.pop();
                continue;
            };
            self.dispatch_exec_inner(index, parent, inner_index, inner, tx)
                .await;
            if !inner.inner().is_empty() {
                stack.push((inner, inner.inner().iter().enumerate()));
            }
        }
    }

    async fn dispatch_exec_inner(
        &self,
        index: usize,
        wrapper: &Message,
        inner_index: usize,
        inner: &Message,
        tx: &Transaction,
    ) {
        for module in self.modules.iter() {
            let Some(handler) = module.as_authz_message() else {
                continue;
            };
            if let Err(err) = handler
                .handle_msg_exec(index, wrapper, inner_index, inner, tx)
                .await
            {
                let err = ModuleError::new(module.name(), ModuleStage::AuthzMessage, err);
                tracing::error!(
                    module = module.name(),
                    height = tx.height,
                    tx_hash = %tx.hash,
                    msg_type = inner.type_url(),
                    msg_index = index,
                    inner_index,
                    error = %err,
                    "module failed to handle exec message"
                );
                self.telemetry.record_module_error();
            }
        }
    }

    fn block_error(&self, module: &str, height: u64, err: AnyError) {
        let err = ModuleError::new(module, ModuleStage::Block, err);
        tracing::error!(
            module,
            height,
            error = %err,
            "module failed to handle block"
        );
        self.telemetry.record_module_error();
    }
}
