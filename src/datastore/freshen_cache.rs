//! Bounded FIFO cache of recently-freshened blocks.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::key::ObjectKey;

/// Capacity of the freshen cache.
pub const FRESHEN_CACHE_SIZE: usize = 1_000_000;

/// Maps content keys to the instant their freshen promise expires.
///
/// Eviction is strictly oldest-insertion-first; a re-inserted key keeps its
/// queue position. The critical sections are all O(1), so a single lock
/// around the whole structure is enough.
pub(crate) struct FreshenCache {
    capacity: usize,
    expiry: HashMap<ObjectKey, Instant>,
    order: VecDeque<ObjectKey>,
}

impl FreshenCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity, expiry: HashMap::new(), order: VecDeque::new() }
    }

    /// Records `key` as freshened for the next `lifetime`.
    pub(crate) fn insert(&mut self, key: ObjectKey, lifetime: Duration) {
        let expires = Instant::now() + lifetime;
        if self.expiry.insert(key, expires).is_some() {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.expiry.remove(&evicted);
            }
        }
        self.order.push_back(key);
    }

    /// True while the key's freshen promise still holds.
    pub(crate) fn good(&self, key: &ObjectKey) -> bool {
        match self.expiry.get(key) {
            Some(expires) => Instant::now() < *expires,
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
