use crate::types::Block;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Unit of work keyed by block height.
///
/// The block is normally fetched by the worker; live subscriptions hand over
/// the block they already received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub height: u64,
    pub block: Option<Block>,
    /// Re-process even if the height is already stored.
    pub force: bool,
    /// Failed processing attempts so far.
    pub attempts: usize,
}

impl WorkItem {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            block: None,
            force: false,
            attempts: 0,
        }
    }

    pub fn with_block(block: Block) -> Self {
        Self {
            height: block.height,
            block: Some(block),
            force: false,
            attempts: 0,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Returned by [`HeightQueue::push`] once the queue has been closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueClosed(pub WorkItem);

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "height queue closed; dropped height {}", self.0.height)
    }
}

impl std::error::Error for QueueClosed {}

struct QueueState {
    items: VecDeque<WorkItem>,
    closed: bool,
}

/// Bounded multi-producer/multi-consumer FIFO of pending heights.
///
/// Every accepted item is handed to exactly one [`HeightQueue::pop`] call.
/// Consumers report completion through [`HeightQueue::complete`], which lets
/// bounded runs wait for the queue to drain.
pub struct HeightQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    /// Items pushed (or reserved for a retry) and not yet completed.
    outstanding: AtomicUsize,
}

impl HeightQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an item, waiting while the queue is full.
    pub async fn push(&self, item: WorkItem) -> Result<(), QueueClosed> {
        self.insert(item, false).await
    }

    /// Schedules a failed item to be pushed again without blocking the caller.
    ///
    /// The item counts as outstanding from the moment this returns, so a
    /// drain waiter cannot observe an empty queue while the push is pending.
    pub fn requeue(self: &Arc<Self>, item: WorkItem) -> JoinHandle<()> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let height = item.height;
            if let Err(err) = queue.insert(item, true).await {
                tracing::debug!(height, error = %err, "queue closed before retry was enqueued");
                queue.release();
            }
        })
    }

    pub async fn pop(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.notify.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks one popped item as done.
    pub fn complete(&self) {
        self.release();
    }

    /// Waits until every accepted item has been completed.
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.outstanding() == 0 || self.is_closed().await {
                return;
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Rejects further pushes and wakes every waiting producer and consumer.
    /// Items still buffered are discarded.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.items.clear();
        self.outstanding.store(0, Ordering::SeqCst);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Re-opens a closed queue for a new run.
    pub async fn reopen(&self) {
        let mut state = self.state.lock().await;
        state.closed = false;
        state.items.clear();
        self.outstanding.store(0, Ordering::SeqCst);
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    fn release(&self) {
        let previous = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                Some(value.saturating_sub(1))
            })
            .unwrap_or_else(|value| value);
        if previous <= 1 {
            self.notify.notify_waiters();
        }
    }

    async fn insert(&self, item: WorkItem, reserved: bool) -> Result<(), QueueClosed> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(QueueClosed(item));
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    if !reserved {
                        self.outstanding.fetch_add(1, Ordering::SeqCst);
                    }
                    drop(state);
                    self.notify.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

impl Default for HeightQueue {
    fn default() -> Self {
        Self::new()
    }
}
