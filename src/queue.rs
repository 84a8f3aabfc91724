//! Bounded handoff queues between interrupt and task context

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use heapless::mpmc::MpMcQueue;

/// Lock-free bounded queue with an occupancy count
///
/// `N` must be a power of two. Pushing never blocks.
pub(crate) struct HandoffQueue<T, const N: usize> {
    queue: MpMcQueue<T, N>,
    pending: AtomicUsize,
}

impl<T, const N: usize> HandoffQueue<T, N> {
    pub const fn new() -> Self {
        Self {
            queue: MpMcQueue::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueue, handing the item back when the queue is full
    pub fn try_push(&self, item: T) -> Result<(), T> {
        // Counted first so a concurrent pop never sees the count underflow
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.queue.enqueue(item).map_err(|item| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            item
        })
    }

    /// Enqueue, retrying until `timeout` elapses
    pub fn push_timeout(&self, item: T, timeout: Duration, poll: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut item = item;
        loop {
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(back) => item = back,
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(item);
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    pub fn pop(&self) -> Option<T> {
        let item = self.queue.dequeue()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Dequeue, waiting up to `timeout` for an item
    pub fn pop_timeout(&self, timeout: Duration, poll: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// Items waiting, possibly counting a push still in flight
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire).min(N)
    }

    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl<T, const N: usize> Default for HandoffQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
