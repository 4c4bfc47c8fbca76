//! Built-in module persisting every top-level message.

use super::registry::ModuleContext;
use super::{MessageModule, Module, ModuleFuture};
use crate::repository::Repository;
use crate::types::{Message, MessageRecord, Transaction};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Extracts the accounts involved in a message.
pub trait AddressParser: Send + Sync {
    fn involved_accounts(&self, msg: &Message) -> Vec<String>;
}

/// Collects string values stored under address-like keys (`sender`,
/// `delegator_address`, `grantee`, ...), walking nested objects, arrays and
/// exec-wrapped messages. Order of first appearance is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAddressParser;

const ADDRESS_KEYS: &[&str] = &[
    "sender",
    "receiver",
    "signer",
    "granter",
    "grantee",
    "from",
    "to",
    "creator",
    "owner",
    "voter",
    "depositor",
    "proposer",
];

impl JsonAddressParser {
    fn is_address_key(key: &str) -> bool {
        key.ends_with("address") || ADDRESS_KEYS.contains(&key)
    }

    fn collect(value: &Value, key: Option<&str>, out: &mut Vec<String>) {
        match value {
            Value::String(text) => {
                if key.is_some_and(Self::is_address_key) && !text.is_empty() {
                    out.push(text.clone());
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::collect(item, key, out);
                }
            }
            Value::Object(map) => {
                for (field, nested) in map {
                    Self::collect(nested, Some(field.as_str()), out);
                }
            }
            _ => {}
        }
    }
}

impl AddressParser for JsonAddressParser {
    fn involved_accounts(&self, msg: &Message) -> Vec<String> {
        let mut found = Vec::new();
        Self::collect(msg.value(), None, &mut found);
        for inner in msg.inner() {
            found.extend(self.involved_accounts(inner));
        }

        let mut seen = HashSet::new();
        found.retain(|address| seen.insert(address.clone()));
        found
    }
}

pub struct MessagesModule {
    repository: Arc<dyn Repository>,
    parser: Arc<dyn AddressParser>,
}

impl MessagesModule {
    pub const NAME: &'static str = "messages";

    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self::with_parser(repository, Arc::new(JsonAddressParser))
    }

    pub fn with_parser(repository: Arc<dyn Repository>, parser: Arc<dyn AddressParser>) -> Self {
        Self { repository, parser }
    }

    pub(crate) fn build(ctx: &ModuleContext) -> Result<Arc<dyn Module>> {
        Ok(Arc::new(Self::new(ctx.repository.clone())))
    }
}

impl Module for MessagesModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_message(&self) -> Option<&dyn MessageModule> {
        Some(self)
    }
}

impl MessageModule for MessagesModule {
    fn handle_msg<'a>(
        &'a self,
        index: usize,
        msg: &'a Message,
        tx: &'a Transaction,
    ) -> ModuleFuture<'a> {
        Box::pin(async move {
            let record = MessageRecord {
                tx_hash: tx.hash.clone(),
                height: tx.height,
                index,
                type_url: msg.type_url().to_owned(),
                value: msg.value().clone(),
                involved_accounts: self.parser.involved_accounts(msg),
            };
            self.repository
                .save_message(&record)
                .await
                .with_context(|| format!("failed to save message {index} of tx {}", tx.hash))
        })
    }
}
