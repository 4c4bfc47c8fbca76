//! In-process [`Repository`] with the same conflict semantics a relational
//! store is expected to provide. Useful for dry runs and tests.

use super::{PruningRepository, Repository};
use crate::types::{Block, CommitSignature, MessageRecord, Transaction, Validator};
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<u64, Block>,
    validators: HashMap<String, Validator>,
    commit_signatures: BTreeMap<(u64, String), CommitSignature>,
    txs: HashMap<String, Transaction>,
    messages: BTreeMap<(String, usize), MessageRecord>,
    last_pruned: u64,
}

/// Snapshot of how many rows each table holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub blocks: usize,
    pub validators: usize,
    pub commit_signatures: usize,
    pub txs: usize,
    pub messages: usize,
}

pub struct MemoryRepository {
    tables: Mutex<Tables>,
    pruning: bool,
    block_inserts: AtomicU64,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            pruning: true,
            block_inserts: AtomicU64::new(0),
        }
    }

    /// Store that does not advertise the pruning capability.
    pub fn without_pruning() -> Self {
        Self {
            pruning: false,
            ..Self::new()
        }
    }

    pub fn row_counts(&self) -> RowCounts {
        let tables = self.lock();
        RowCounts {
            blocks: tables.blocks.len(),
            validators: tables.validators.len(),
            commit_signatures: tables.commit_signatures.len(),
            txs: tables.txs.len(),
            messages: tables.messages.len(),
        }
    }

    /// Number of block rows actually inserted (conflicting writes excluded).
    pub fn block_inserts(&self) -> u64 {
        self.block_inserts.load(Ordering::SeqCst)
    }

    pub fn block(&self, height: u64) -> Option<Block> {
        self.lock().blocks.get(&height).cloned()
    }

    pub fn heights(&self) -> Vec<u64> {
        self.lock().blocks.keys().copied().collect()
    }

    pub fn commit_signatures_at(&self, height: u64) -> Vec<CommitSignature> {
        self.lock()
            .commit_signatures
            .range((height, String::new())..)
            .take_while(|((sig_height, _), _)| *sig_height == height)
            .map(|(_, sig)| sig.clone())
            .collect()
    }

    pub fn messages_at(&self, height: u64) -> Vec<MessageRecord> {
        self.lock()
            .messages
            .values()
            .filter(|record| record.height == height)
            .cloned()
            .collect()
    }

    pub fn tx(&self, hash: &str) -> Option<Transaction> {
        self.lock().txs.get(hash).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("memory repository mutex poisoned")
    }
}

impl Repository for MemoryRepository {
    fn has_block(&self, height: u64) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { Ok(self.lock().blocks.contains_key(&height)) })
    }

    fn save_block<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tables = self.lock();
            if !tables.blocks.contains_key(&block.height) {
                tables.blocks.insert(block.height, block.clone());
                self.block_inserts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn save_validators<'a>(&'a self, validators: &'a [Validator]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tables = self.lock();
            for validator in validators {
                tables
                    .validators
                    .insert(validator.consensus_address.clone(), validator.clone());
            }
            Ok(())
        })
    }

    fn save_commit_signatures<'a>(
        &'a self,
        signatures: &'a [CommitSignature],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tables = self.lock();
            for sig in signatures {
                tables
                    .commit_signatures
                    .entry((sig.height, sig.validator_address.clone()))
                    .or_insert_with(|| sig.clone());
            }
            Ok(())
        })
    }

    fn save_tx<'a>(&'a self, tx: &'a Transaction) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.lock()
                .txs
                .entry(tx.hash.clone())
                .or_insert_with(|| tx.clone());
            Ok(())
        })
    }

    fn save_message<'a>(&'a self, message: &'a MessageRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.lock()
                .messages
                .entry((message.tx_hash.clone(), message.index))
                .or_insert_with(|| message.clone());
            Ok(())
        })
    }

    fn last_block_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .blocks
                .keys()
                .next_back()
                .copied()
                .unwrap_or(0))
        })
    }

    fn missing_heights(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Vec<u64>>> {
        Box::pin(async move {
            if start > end {
                return Ok(Vec::new());
            }
            let tables = self.lock();
            Ok((start..=end)
                .filter(|height| !tables.blocks.contains_key(height))
                .collect())
        })
    }

    fn as_pruning(&self) -> Option<&dyn PruningRepository> {
        if self.pruning {
            Some(self)
        } else {
            None
        }
    }
}

impl PruningRepository for MemoryRepository {
    fn last_pruned(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.lock().last_pruned) })
    }

    fn store_last_pruned(&self, height: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock().last_pruned = height;
            Ok(())
        })
    }

    fn prune(&self, height: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tables = self.lock();
            tables
                .commit_signatures
                .retain(|(sig_height, _), _| *sig_height != height);
            tables.messages.retain(|_, record| record.height != height);
            Ok(())
        })
    }
}
