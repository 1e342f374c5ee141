//! A small bounded async queue with a configurable overflow policy.
//!
//! The teacher crate never needs this: its channels are plain `mpsc`/
//! `broadcast`, which either block or lag. This spec requires two distinct
//! *non-blocking* discard policies (sliding-window / drop-oldest for inbound
//! traffic, drop-newest for outbound), so neither stdlib channel fits as-is.
//! `BoundedQueue` is the standard `Mutex<VecDeque<T>> + Notify` shape for a
//! hand-rolled bounded channel in async Rust when no crate in the stack
//! already provides the exact policy needed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// What happens to an incoming item when the queue is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Discard the oldest queued item to make room (favors recency).
    DropOldest,
    /// Discard the incoming item (a slow consumer cannot stall the producer).
    DropNewest,
}

pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    policy: Overflow,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: Overflow) -> Self {
        BoundedQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity,
            policy,
            closed: AtomicBool::new(false),
        }
    }

    /// Pushes an item, applying the overflow policy if the queue is full.
    /// Never blocks. A push onto a closed queue is silently dropped.
    pub fn push(&self, item: T) {
        if self.is_closed() {
            return;
        }
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.len() >= self.capacity {
                match self.policy {
                    Overflow::DropOldest => {
                        guard.pop_front();
                        guard.push_back(item);
                    }
                    Overflow::DropNewest => {
                        // New item loses; queue contents unchanged.
                    }
                }
            } else {
                guard.push_back(item);
            }
        }
        self.notify.notify_one();
    }

    /// Awaits the next item, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut guard = self.inner.lock().unwrap();
                if let Some(item) = guard.pop_front() {
                    return Some(item);
                }
                if self.is_closed() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the queue closed and wakes any pending receiver.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
