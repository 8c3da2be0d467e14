//! Bounded FIFO used between the capture callback and the sender.
//!
//! The queue itself is not synchronized; [`StreamBridge`](super::StreamBridge)
//! keeps it under the same mutex as the stream state so that the state
//! check and the mutation happen atomically.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens when a frame arrives and the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame. Keeps latency bounded.
    DropOldest,
    /// Wait for the consumer up to `timeout`, then give up and stop
    /// streaming.
    Block {
        #[serde(with = "millis")]
        timeout: Duration,
    },
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Result of [`BoundedQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum Push<T> {
    /// The element was appended.
    Queued,
    /// The element was appended after evicting the returned oldest one.
    Evicted(T),
    /// The queue is full; the element is handed back untouched.
    Full(T),
}

/// Fixed-capacity FIFO.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    pushed: u64,
    popped: u64,
    dropped: u64,
}

impl<T> BoundedQueue<T> {
    /// Creates an empty queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            pushed: 0,
            popped: 0,
            dropped: 0,
        }
    }

    /// Appends `item`, applying the drop-oldest rule when `evict` is set.
    pub fn push(&mut self, item: T, evict: bool) -> Push<T> {
        if self.items.len() < self.capacity {
            self.items.push_back(item);
            self.pushed += 1;
            return Push::Queued;
        }
        if !evict {
            return Push::Full(item);
        }
        // capacity >= 1, so a full queue always has a front element
        match self.items.pop_front() {
            Some(oldest) => {
                self.items.push_back(item);
                self.pushed += 1;
                self.dropped += 1;
                Push::Evicted(oldest)
            }
            None => {
                self.items.push_back(item);
                self.pushed += 1;
                Push::Queued
            }
        }
    }

    /// Removes the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.popped += 1;
        }
        item
    }

    /// Removes every element, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns (pushed, popped, dropped) counters.
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.pushed, self.popped, self.dropped)
    }
}
