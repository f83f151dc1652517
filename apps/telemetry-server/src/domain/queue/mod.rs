//! Delivery Queue
//!
//! A bounded priority queue between one session's producer and its send loop.
//!
//! - Higher priority items are returned first; equal priorities keep
//!   submission order.
//! - `put` waits for capacity and `get` waits for data.
//! - [`DeliveryQueue::dispose`] is one-shot: the first call drops pending
//!   items and wakes every waiter, later calls are no-ops. After disposal
//!   every `get` and `put` fails with [`QueueError::Disposed`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Items that carry a queue priority. Larger values are delivered first.
pub trait Prioritized {
    /// Priority of this item.
    fn priority(&self) -> u32;
}

/// Queue operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue has been disposed.
    #[error("queue: disposed")]
    Disposed,
}

struct Entry<T> {
    priority: u32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap: highest priority, then lowest sequence, on top.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    disposed: bool,
}

/// Bounded, disposable priority queue.
pub struct DeliveryQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl<T: Prioritized> DeliveryQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                disposed: false,
            }),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Add items, waiting for capacity as needed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Disposed`] if the queue is or becomes disposed.
    /// Items already accepted before disposal are dropped with the queue.
    pub async fn put(&self, items: impl IntoIterator<Item = T>) -> Result<(), QueueError> {
        for item in items {
            self.put_one(item).await?;
        }
        Ok(())
    }

    async fn put_one(&self, item: T) -> Result<(), QueueError> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(QueueError::Disposed);
                }
                if state.heap.len() < self.capacity {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.heap.push(Entry {
                        priority: item.priority(),
                        seq,
                        item,
                    });
                    drop(state);
                    self.readable.notify_waiters();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Take up to `n` items (at least one), waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Disposed`] if the queue is or becomes disposed.
    pub async fn get(&self, n: usize) -> Result<Vec<T>, QueueError> {
        let n = n.max(1);
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(QueueError::Disposed);
                }
                if !state.heap.is_empty() {
                    let take = n.min(state.heap.len());
                    let items = (0..take)
                        .filter_map(|_| state.heap.pop().map(|entry| entry.item))
                        .collect();
                    drop(state);
                    self.writable.notify_waiters();
                    return Ok(items);
                }
            }

            notified.await;
        }
    }

    /// Dispose the queue. Returns `true` only for the call that disposed it.
    pub fn dispose(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return false;
            }
            state.disposed = true;
            state.heap.clear();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        true
    }

    /// Whether the queue has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether the queue holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
