//! Bounded FIFO buffering with counted overflow.

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::debug;

/// What a [`Buffer`] does with an item offered while it is full.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the offered item, keeping everything already buffered.
    RejectNewest,

    /// Evict the oldest buffered item to make room for the offered item.
    DropOldest,
}

/// A capacity-limited FIFO.
///
/// Every item ever offered is counted in [`total`][Self::total], and every item lost to overflow (whether rejected or
/// evicted, depending on the [`OverflowPolicy`]) is counted in [`drops`][Self::drops]. Items are always removed oldest
/// first.
#[derive(Debug)]
pub struct Buffer<T> {
    name: &'static str,
    items: VecDeque<T>,
    capacity: usize,
    policy: OverflowPolicy,
    total: u64,
    drops: u64,
}

impl<T> Buffer<T> {
    /// Creates a new `Buffer` with the given capacity and overflow policy.
    ///
    /// `name` only identifies the buffer in logs.
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            name,
            items: VecDeque::new(),
            capacity,
            policy,
            total: 0,
            drops: 0,
        }
    }

    /// Offers a single item to the buffer.
    ///
    /// Returns `true` if the buffer accepted the item without losing anything.
    pub fn push(&mut self, item: T) -> bool {
        self.total += 1;

        if self.items.len() < self.capacity {
            self.items.push_back(item);
            return true;
        }

        self.drops += 1;
        match self.policy {
            OverflowPolicy::RejectNewest => {
                debug!(buffer = self.name, capacity = self.capacity, "Buffer full. Rejected item.");
            }
            OverflowPolicy::DropOldest => {
                // A zero-capacity buffer has nothing to evict, so the offered item is the one lost.
                if self.items.pop_front().is_some() {
                    self.items.push_back(item);
                }
                debug!(buffer = self.name, capacity = self.capacity, "Buffer full. Evicted oldest item.");
            }
        }
        false
    }

    /// Offers every item from `items` to the buffer, in order.
    ///
    /// Returns the number of items lost to overflow.
    pub fn add<I>(&mut self, items: I) -> u64
    where
        I: IntoIterator<Item = T>,
    {
        let drops_before = self.drops;
        for item in items {
            self.push(item);
        }
        self.drops - drops_before
    }

    /// Removes and returns up to `n` of the oldest items.
    pub fn batch(&mut self, n: usize) -> Vec<T> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }

    /// Returns a reference to the oldest item without removing it.
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Returns an iterator over the buffered items, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Removes and returns the oldest item, if any.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Returns the number of buffered items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the buffer holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of items ever offered, whether accepted or not.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the number of items lost to overflow.
    pub fn drops(&self) -> u64 {
        self.drops
    }
}
