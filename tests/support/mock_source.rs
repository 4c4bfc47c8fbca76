use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use protoindex::{
    Block, Commit, CommitSig, GenesisDoc, Message, NewBlockStream, Source, Transaction, Validator,
    ValidatorSet, MSG_EXEC_TYPE_URL,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const VALIDATORS: [&str; 2] = ["VAL1", "VAL2"];

/// Deterministic in-memory chain with scriptable failures and a manually
/// driven new-block subscription.
pub struct MockSource {
    head: AtomicU64,
    txs_per_block: usize,
    with_exec: bool,
    offline: AtomicBool,
    block_failures: Mutex<HashMap<u64, usize>>,
    block_calls: Mutex<HashMap<u64, usize>>,
    subscriber: Mutex<Option<mpsc::Sender<Block>>>,
    subscriptions: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl MockSource {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            txs_per_block: 1,
            with_exec: false,
            offline: AtomicBool::new(false),
            block_failures: Mutex::new(HashMap::new()),
            block_calls: Mutex::new(HashMap::new()),
            subscriber: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn with_txs_per_block(mut self, count: usize) -> Self {
        self.txs_per_block = count;
        self
    }

    /// Appends an exec-wrapped message to every transaction.
    pub fn with_exec_messages(mut self) -> Self {
        self.with_exec = true;
        self
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes the next `times` fetches of `height` fail.
    pub fn fail_block(&self, height: u64, times: usize) {
        self.block_failures
            .lock()
            .expect("mock source poisoned")
            .insert(height, times);
    }

    pub fn block_calls(&self, height: u64) -> usize {
        self.block_calls
            .lock()
            .expect("mock source poisoned")
            .get(&height)
            .copied()
            .unwrap_or(0)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Delivers `height` to the active subscriber and advances the head.
    pub async fn publish(&self, height: u64) -> Result<()> {
        let sender = self
            .subscriber
            .lock()
            .expect("mock source poisoned")
            .clone()
            .ok_or_else(|| anyhow!("nobody subscribed to new blocks"))?;
        self.head.fetch_max(height, Ordering::SeqCst);
        sender
            .send(build_block(height, self.txs_per_block))
            .await
            .map_err(|_| anyhow!("subscriber went away"))
    }

    /// Closes the subscription as a crashed websocket would.
    pub fn drop_subscription(&self) {
        self.subscriber.lock().expect("mock source poisoned").take();
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

pub fn build_block(height: u64, txs: usize) -> Block {
    Block {
        height,
        hash: format!("HASH{height}"),
        timestamp: format!("2024-01-01T00:00:{:02}Z", height % 60),
        proposer_address: VALIDATORS[(height % 2) as usize].to_owned(),
        txs: (0..txs)
            .map(|index| Bytes::from(format!("tx-{height}-{index}")))
            .collect(),
        last_commit: Commit {
            height: height.saturating_sub(1),
            signatures: VALIDATORS
                .iter()
                .map(|address| CommitSig {
                    validator_address: (*address).to_owned(),
                    timestamp: "t".to_owned(),
                })
                .collect(),
        },
    }
}

pub fn tx_hash(height: u64, index: usize) -> String {
    format!("TX{height}-{index}")
}

fn build_tx(height: u64, index: usize, with_exec: bool) -> Transaction {
    let mut messages = vec![Message::from_json(json!({
        "@type": "/cosmos.bank.v1beta1.MsgSend",
        "from_address": format!("cosmos1sender{height}"),
        "to_address": "cosmos1receiver",
    }))];
    if with_exec {
        messages.push(Message::from_json(json!({
            "@type": MSG_EXEC_TYPE_URL,
            "grantee": "cosmos1grantee",
            "msgs": [
                {"@type": "/cosmos.staking.v1beta1.MsgDelegate", "delegator_address": "cosmos1granter"},
                {"@type": "/cosmos.gov.v1beta1.MsgVote", "voter": "cosmos1granter"}
            ]
        })));
    }

    Transaction {
        hash: tx_hash(height, index),
        height,
        success: true,
        messages,
        memo: String::new(),
        fee: Value::Null,
        signer_infos: Vec::new(),
        gas_wanted: 200_000,
        gas_used: 80_000,
        raw_log: String::new(),
        events: Vec::new(),
    }
}

impl Source for MockSource {
    fn latest_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(self.head.load(Ordering::SeqCst))
        })
    }

    fn block(&self, height: u64) -> BoxFuture<'_, Result<Block>> {
        Box::pin(async move {
            self.check_online()?;
            *self
                .block_calls
                .lock()
                .expect("mock source poisoned")
                .entry(height)
                .or_default() += 1;

            {
                let mut failures = self.block_failures.lock().expect("mock source poisoned");
                if let Some(remaining) = failures.get_mut(&height) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        bail!("injected failure fetching block {height}");
                    }
                }
            }

            if height > self.head.load(Ordering::SeqCst) {
                bail!("height {height} must be less than or equal to the current head");
            }
            Ok(build_block(height, self.txs_per_block))
        })
    }

    fn txs<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, Result<Vec<Transaction>>> {
        Box::pin(async move {
            self.check_online()?;
            Ok((0..block.txs.len())
                .map(|index| build_tx(block.height, index, self.with_exec))
                .collect())
        })
    }

    fn validators(&self, height: u64) -> BoxFuture<'_, Result<ValidatorSet>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(ValidatorSet {
                height,
                validators: VALIDATORS
                    .iter()
                    .enumerate()
                    .map(|(rank, address)| Validator {
                        consensus_address: (*address).to_owned(),
                        consensus_pubkey: format!("pk-{address}"),
                        voting_power: 10 * (rank as i64 + 1),
                        proposer_priority: 0,
                    })
                    .collect(),
            })
        })
    }

    fn genesis(&self) -> BoxFuture<'_, Result<GenesisDoc>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(GenesisDoc {
                chain_id: "mock-1".to_owned(),
                genesis_time: "2024-01-01T00:00:00Z".to_owned(),
                initial_height: 1,
                app_state: json!({"bank": {"balances": []}}),
            })
        })
    }

    fn subscribe_new_blocks(&self) -> BoxFuture<'_, Result<NewBlockStream>> {
        Box::pin(async move {
            self.check_online()?;
            let (sender, receiver) = mpsc::channel(16);
            *self.subscriber.lock().expect("mock source poisoned") = Some(sender);
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            Ok(receiver)
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.drop_subscription();
            Ok(())
        })
    }
}
