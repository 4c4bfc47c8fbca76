//! Wire shapes of the CometBFT JSON-RPC responses the client consumes and their
//! conversion into pipeline records.
//!
//! CometBFT encodes 64-bit integers as decimal strings and transaction bytes as
//! base64; both are normalized here.

use crate::types::{
    u64_from_str_or_number, Block, Commit, CommitSig, GenesisDoc, Validator, ValidatorSet,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(crate) struct StatusResponse {
    #[serde(default)]
    pub node_info: NodeInfo,
    pub sync_info: SyncInfo,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct NodeInfo {
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SyncInfo {
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub latest_block_height: u64,
    #[serde(default)]
    pub catching_up: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlockResponse {
    pub block_id: BlockId,
    pub block: RawBlock,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlockId {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBlock {
    pub header: Header,
    #[serde(default)]
    pub data: BlockData,
    #[serde(default)]
    pub last_commit: Option<RawCommit>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Header {
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub height: u64,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub proposer_address: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BlockData {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub txs: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawCommit {
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub height: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub signatures: Vec<RawCommitSig>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawCommitSig {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub validator_address: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub timestamp: String,
}

impl BlockResponse {
    pub(crate) fn into_block(self) -> Result<Block> {
        let height = self.block.header.height;
        let txs = self
            .block
            .data
            .txs
            .iter()
            .enumerate()
            .map(|(index, encoded)| {
                BASE64_STANDARD
                    .decode(encoded)
                    .map(Bytes::from)
                    .with_context(|| format!("tx {index} of block {height} is not valid base64"))
            })
            .collect::<Result<Vec<_>>>()?;

        let last_commit = self
            .block
            .last_commit
            .map(|commit| Commit {
                height: commit.height,
                signatures: commit
                    .signatures
                    .into_iter()
                    .map(|sig| CommitSig {
                        validator_address: sig.validator_address,
                        timestamp: sig.timestamp,
                    })
                    .collect(),
            })
            .unwrap_or_default();

        Ok(Block {
            height,
            hash: self.block_id.hash,
            timestamp: self.block.header.time,
            proposer_address: self.block.header.proposer_address,
            txs,
            last_commit,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ValidatorsResponse {
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub block_height: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub validators: Vec<RawValidator>,
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub total: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawValidator {
    pub address: String,
    pub pub_key: PubKey,
    #[serde(deserialize_with = "i64_from_str_or_number")]
    pub voting_power: i64,
    #[serde(default, deserialize_with = "i64_from_str_or_number")]
    pub proposer_priority: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubKey {
    #[serde(default)]
    pub value: String,
}

impl From<RawValidator> for Validator {
    fn from(raw: RawValidator) -> Self {
        Validator {
            consensus_address: raw.address,
            consensus_pubkey: raw.pub_key.value,
            voting_power: raw.voting_power,
            proposer_priority: raw.proposer_priority,
        }
    }
}

/// Merges paginated `validators` pages into one set.
pub(crate) fn validator_set(height: u64, pages: Vec<ValidatorsResponse>) -> ValidatorSet {
    ValidatorSet {
        height,
        validators: pages
            .into_iter()
            .flat_map(|page| page.validators)
            .map(Validator::from)
            .collect(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenesisResponse {
    pub genesis: GenesisDoc,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TxSearchResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub txs: Vec<RawTxResult>,
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub total_count: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawTxResult {
    pub hash: String,
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub height: u64,
    pub index: u32,
    pub tx_result: TxResult,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub log: String,
    #[serde(default, deserialize_with = "i64_from_str_or_number")]
    pub gas_wanted: i64,
    #[serde(default, deserialize_with = "i64_from_str_or_number")]
    pub gas_used: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub events: Vec<Value>,
}

fn i64_from_str_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) if text.is_empty() => Ok(0),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
