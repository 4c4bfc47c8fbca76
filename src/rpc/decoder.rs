//! Raw transaction decoding.
//!
//! Blocks carry transactions as opaque bytes. A [`TxDecoder`] turns them into
//! messages plus the auth metadata stored alongside each transaction.

use crate::types::Message;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Fields recovered from a transaction's bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedTx {
    pub messages: Vec<Message>,
    pub memo: String,
    pub fee: Value,
    pub signer_infos: Vec<Value>,
}

pub trait TxDecoder: Send + Sync + 'static {
    fn decode(&self, raw: &[u8]) -> Result<DecodedTx>;
}

/// Decodes transactions serialized as JSON in the
/// `{"body": {...}, "auth_info": {...}}` layout, which is what chains built
/// with amino-JSON signing and most test networks emit.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTxDecoder;

#[derive(Deserialize)]
struct JsonTx {
    #[serde(default)]
    body: JsonBody,
    #[serde(default)]
    auth_info: JsonAuthInfo,
}

#[derive(Default, Deserialize)]
struct JsonBody {
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    memo: String,
}

#[derive(Default, Deserialize)]
struct JsonAuthInfo {
    #[serde(default)]
    fee: Value,
    #[serde(default)]
    signer_infos: Vec<Value>,
}

impl TxDecoder for JsonTxDecoder {
    fn decode(&self, raw: &[u8]) -> Result<DecodedTx> {
        let tx: JsonTx = serde_json::from_slice(raw).context("transaction is not valid JSON")?;
        Ok(DecodedTx {
            messages: tx.body.messages.into_iter().map(Message::from_json).collect(),
            memo: tx.body.memo,
            fee: tx.auth_info.fee,
            signer_infos: tx.auth_info.signer_infos,
        })
    }
}
