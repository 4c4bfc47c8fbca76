use std::sync::atomic::{AtomicU64, Ordering};

const UNINITIALIZED: u64 = 0;

/// Tracks the highest height indexed during the current run.
///
/// Workers complete heights out of order, so this is a high-water mark and
/// says nothing about gaps below it.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    highest_indexed: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.highest_indexed.store(UNINITIALIZED, Ordering::SeqCst);
    }

    pub fn mark_indexed(&self, height: u64) {
        self.highest_indexed.fetch_max(height, Ordering::SeqCst);
    }

    pub fn highest_indexed(&self) -> Option<u64> {
        match self.highest_indexed.load(Ordering::SeqCst) {
            UNINITIALIZED => None,
            value => Some(value),
        }
    }
}
