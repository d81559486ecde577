//! Bounded outbound queue for one session's stream.
//!
//! The publisher side never waits: when the queue is full the configured
//! overflow policy decides which message is discarded.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Default queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// What to discard when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Discard the incoming message.
    DropNewest,
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after evicting the oldest message.
    DroppedOldest,
    /// Incoming message discarded.
    DroppedNewest,
    /// Queue is closed; message discarded.
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Single-consumer bounded queue with a non-blocking producer side.
pub struct StreamQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> StreamQueue<T> {
    /// Create a queue. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(32)),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a message, applying the overflow policy when full.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                PushOutcome::Queued
            } else {
                inner.dropped = inner.dropped.saturating_add(1);
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.items.push_back(item);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                }
            }
        };
        if outcome != PushOutcome::DroppedNewest {
            self.notify.notify_one();
        }
        outcome
    }

    /// Wait for the next message. Returns `None` once the queue is closed.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Take the next message without waiting.
    pub fn try_recv(&self) -> Option<T> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        inner.items.pop_front()
    }

    /// Close the queue and release every undelivered message.
    ///
    /// Returns the number of messages released. Waiting consumers wake up
    /// and observe `None`.
    pub fn close(&self) -> usize {
        let released = {
            let mut inner = self.lock();
            inner.closed = true;
            let released = inner.items.len();
            inner.items.clear();
            inner.items.shrink_to_fit();
            released
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        released
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Messages discarded by the overflow policy so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Configured bound.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
