//! Chain records flowing through the pipeline: blocks, transactions, messages,
//! validators and commit signatures as fetched from a [`crate::Source`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Type URL of the authz wrapper whose payload is a list of messages executed
/// on behalf of another account.
pub const MSG_EXEC_TYPE_URL: &str = "/cosmos.authz.v1beta1.MsgExec";

/// Finalized block as returned by the upstream node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub timestamp: String,
    pub proposer_address: String,
    /// Raw transaction bytes in block order.
    pub txs: Vec<Bytes>,
    pub last_commit: Commit,
}

impl Block {
    /// Joins the last-commit signatures with the validator set so every
    /// signature carries the signer's voting power and proposer priority.
    ///
    /// Absent votes are skipped. A signer missing from `validators` is an
    /// error; the caller decides which set to retry the join against.
    pub fn commit_signatures(
        &self,
        validators: &ValidatorSet,
    ) -> Result<Vec<CommitSignature>, UnknownSigner> {
        let by_address: HashMap<&str, &Validator> = validators
            .validators
            .iter()
            .map(|validator| (validator.consensus_address.as_str(), validator))
            .collect();

        self.last_commit
            .signatures
            .iter()
            .filter(|sig| !sig.validator_address.is_empty())
            .map(|sig| {
                let validator = by_address
                    .get(sig.validator_address.as_str())
                    .ok_or_else(|| UnknownSigner {
                        height: self.last_commit.height,
                        validator_set_height: validators.height,
                        address: sig.validator_address.clone(),
                    })?;
                Ok(CommitSignature {
                    validator_address: sig.validator_address.clone(),
                    height: self.last_commit.height,
                    timestamp: sig.timestamp.clone(),
                    voting_power: validator.voting_power,
                    proposer_priority: validator.proposer_priority,
                })
            })
            .collect()
    }
}

/// A last-commit signer that is not part of the validator set used for the join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSigner {
    /// Height signed by the commit.
    pub height: u64,
    pub validator_set_height: u64,
    pub address: String,
}

impl std::fmt::Display for UnknownSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "commit signer {} for height {} is missing from the validator set at height {}",
            self.address, self.height, self.validator_set_height
        )
    }
}

impl std::error::Error for UnknownSigner {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Height the commit signs, i.e. the parent of the block carrying it.
    pub height: u64,
    pub signatures: Vec<CommitSig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    pub validator_address: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub consensus_address: String,
    pub consensus_pubkey: String,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub height: u64,
    pub validators: Vec<Validator>,
}

impl ValidatorSet {
    /// Returns the validators with duplicate consensus addresses removed,
    /// keeping the first occurrence.
    pub fn deduplicated(&self) -> Vec<Validator> {
        let mut seen = std::collections::HashSet::new();
        self.validators
            .iter()
            .filter(|validator| seen.insert(validator.consensus_address.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSignature {
    pub validator_address: String,
    pub height: u64,
    pub timestamp: String,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub height: u64,
    pub success: bool,
    pub messages: Vec<Message>,
    pub memo: String,
    pub fee: Value,
    pub signer_infos: Vec<Value>,
    pub gas_wanted: i64,
    pub gas_used: i64,
    pub raw_log: String,
    pub events: Vec<Value>,
}

/// A transaction-scoped message.
///
/// `Exec` wraps further messages executed on behalf of the granter; storage
/// never unwraps it, dispatch does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Standard { type_url: String, value: Value },
    Exec {
        type_url: String,
        value: Value,
        msgs: Vec<Message>,
    },
}

impl Message {
    /// Builds a message from its JSON form (`{"@type": ..., ...}`), unwrapping
    /// authz exec payloads recursively.
    pub fn from_json(value: Value) -> Self {
        let type_url = value
            .get("@type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        if type_url == MSG_EXEC_TYPE_URL {
            let msgs = value
                .get("msgs")
                .and_then(Value::as_array)
                .map(|inner| inner.iter().cloned().map(Message::from_json).collect())
                .unwrap_or_default();
            return Message::Exec {
                type_url,
                value,
                msgs,
            };
        }

        Message::Standard { type_url, value }
    }

    pub fn type_url(&self) -> &str {
        match self {
            Message::Standard { type_url, .. } | Message::Exec { type_url, .. } => type_url,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Message::Standard { value, .. } | Message::Exec { value, .. } => value,
        }
    }

    /// Messages wrapped by an exec message; empty for standard messages.
    pub fn inner(&self) -> &[Message] {
        match self {
            Message::Standard { .. } => &[],
            Message::Exec { msgs, .. } => msgs,
        }
    }
}

/// Row persisted for a top-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub tx_hash: String,
    pub height: u64,
    pub index: usize,
    pub type_url: String,
    pub value: Value,
    pub involved_accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    pub genesis_time: String,
    #[serde(default = "default_initial_height", deserialize_with = "u64_from_str_or_number")]
    pub initial_height: u64,
    #[serde(default)]
    pub app_state: Value,
}

fn default_initial_height() -> u64 {
    1
}

/// Accepts integers encoded either as JSON numbers or as decimal strings, the
/// way CometBFT serializes 64-bit values.
pub(crate) fn u64_from_str_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
