//! A bounded, multi-producer multi-consumer FIFO queue with an explicit,
//! idempotent `close()`.
//!
//! `tokio::sync::mpsc` almost fits, but its `Sender::closed()` is about the
//! *receiver* going away, not a coordinator telling every producer and
//! consumer to stop. Once `Sender` clones are handed to several source
//! tasks, there is no single owner left who can flip the channel to "closed,
//! drain the rest, then report done" for everyone at once. So this is a small
//! hand-rolled structure over the same primitives the rest of the crate
//! already leans on (`parking_lot` for the lock, `tokio::sync::Notify` for
//! async wakeups) instead of another channel abstraction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why a `put` or `get` returned without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClosed {
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Put,
    TimedOut,
}

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be >= 1");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fraction of capacity currently occupied, used by the back-pressure
    /// controller to compare against its watermarks.
    pub fn occupancy(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Blocks until there is room, the queue closes, or `timeout` elapses.
    /// Returns `Ok(PutOutcome::TimedOut)` on a timeout rather than an error:
    /// a full queue under a live back-pressure gate is an expected, frequent
    /// condition, not a failure.
    pub async fn put(&self, item: T, timeout: Duration) -> Result<PutOutcome, QueueClosed> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_closed() {
                return Err(QueueClosed::Closed);
            }

            {
                let mut guard = self.items.lock();
                if guard.len() < self.capacity {
                    guard.push_back(item);
                    drop(guard);
                    self.not_empty.notify_one();
                    return Ok(PutOutcome::Put);
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(PutOutcome::TimedOut);
            }

            tokio::select! {
                _ = self.not_full.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Pushes without waiting for room, used by adapters draining into an
    /// already-sized buffer that must never block the caller.
    pub fn try_put(&self, item: T) -> Result<bool, QueueClosed> {
        if self.is_closed() {
            return Err(QueueClosed::Closed);
        }
        let mut guard = self.items.lock();
        if guard.len() < self.capacity {
            guard.push_back(item);
            drop(guard);
            self.not_empty.notify_one();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Blocks until an item is available, the queue closes and drains, or
    /// `timeout` elapses. Returns `Ok(None)` on a timeout; `Err(QueueClosed)`
    /// only once the queue is both closed and empty.
    pub async fn get(&self, timeout: Duration) -> Result<Option<T>, QueueClosed> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut guard = self.items.lock();
                if let Some(item) = guard.pop_front() {
                    drop(guard);
                    self.not_full.notify_one();
                    return Ok(Some(item));
                }
            }

            if self.is_closed() {
                return Err(QueueClosed::Closed);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Idempotent. Wakes every waiter; subsequent `put` calls fail
    /// immediately, subsequent `get` calls drain the remaining backlog
    /// before reporting `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}
