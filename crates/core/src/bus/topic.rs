use std::fmt;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// Behaviour of [`BoundedTopic::publish`] when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Wait for free capacity, bounded by the caller's timeout.
    Block,
    /// Reject the incoming message and leave pending content untouched.
    DropNewest,
    /// Evict the oldest pending message and retry once.
    DropOldest,
}

/// How long a publish or subscribe call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    NoWait,
    Forever,
    After(Duration),
}

impl Timeout {
    pub fn from_millis(millis: u64) -> Self {
        Self::After(Duration::from_millis(millis))
    }
}

/// Fixed-capacity FIFO of one event type with a fixed overflow policy.
///
/// The ring is allocated once at construction and holds at most
/// `capacity()` messages for the lifetime of the topic.
pub struct BoundedTopic<T> {
    name: &'static str,
    policy: OverflowPolicy,
    capacity: usize,
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T: Copy + Send> BoundedTopic<T> {
    /// Creates a topic. `capacity` must be at least one; the bus validates
    /// depths before constructing topics.
    pub(crate) fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        debug_assert!(capacity > 0, "topic {name} needs a non-zero depth");
        let (tx, rx) = bounded(capacity);
        Self {
            name,
            policy,
            capacity,
            tx,
            rx,
        }
    }

    /// Enqueues a copy of `msg`, applying the topic's overflow policy.
    ///
    /// The timeout only matters for [`OverflowPolicy::Block`]; the drop
    /// policies never wait.
    pub fn publish(&self, msg: T, timeout: Timeout) -> bool {
        match self.policy {
            OverflowPolicy::Block => match timeout {
                Timeout::NoWait => self.tx.try_send(msg).is_ok(),
                Timeout::Forever => self.tx.send(msg).is_ok(),
                Timeout::After(limit) => self.tx.send_timeout(msg, limit).is_ok(),
            },
            OverflowPolicy::DropNewest => match self.tx.try_send(msg) {
                Ok(()) => true,
                Err(_) => {
                    tracing::trace!(topic = self.name, "queue full, dropped newest");
                    false
                }
            },
            OverflowPolicy::DropOldest => match self.tx.try_send(msg) {
                Ok(()) => true,
                Err(TrySendError::Full(msg)) => {
                    // A concurrent subscriber may have emptied a slot already;
                    // either way one retry is enough.
                    let _ = self.rx.try_recv();
                    tracing::trace!(topic = self.name, "queue full, evicted oldest");
                    self.tx.try_send(msg).is_ok()
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }

    /// Dequeues the oldest pending message, waiting up to `timeout`.
    pub fn subscribe(&self, timeout: Timeout) -> Option<T> {
        match timeout {
            Timeout::NoWait => self.rx.try_recv().ok(),
            Timeout::Forever => self.rx.recv().ok(),
            Timeout::After(limit) => match self.rx.recv_timeout(limit) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        }
    }

    pub fn try_subscribe(&self) -> Option<T> {
        self.subscribe(Timeout::NoWait)
    }

    /// Number of messages currently queued.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Discards all pending content. Only meant for controlled shutdown.
    pub fn purge(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

impl<T> fmt::Debug for BoundedTopic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTopic")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("capacity", &self.capacity)
            .field("pending", &self.rx.len())
            .finish()
    }
}
