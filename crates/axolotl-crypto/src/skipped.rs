//! Bounded cache of message keys derived ahead of time for messages that
//! have not arrived yet.
//!
//! Entries are keyed by (sender ratchet key, counter) and kept in insertion
//! order; inserting past capacity evicts the oldest entries first. Keys leave
//! the cache exactly once: when taken for decryption, when evicted, when their
//! chain is dropped, or when they outlive the configured age.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::curve::PublicKey;
use crate::ratchet::MessageKeys;

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: PublicKey,
    keys: MessageKeys,
    /// Unix seconds at which the key was cached.
    stored_at: u64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SkippedKeyCache {
    entries: VecDeque<SkippedKey>,
}

impl SkippedKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, ratchet_key: &PublicKey, counter: u32) -> bool {
        self.position(ratchet_key, counter).is_some()
    }

    /// Cache `keys` and evict the oldest entries beyond `capacity`.
    /// Returns how many entries were evicted.
    pub fn insert(
        &mut self,
        ratchet_key: PublicKey,
        keys: MessageKeys,
        stored_at: u64,
        capacity: usize,
    ) -> usize {
        if let Some(existing) = self.position(&ratchet_key, keys.counter()) {
            self.entries.remove(existing);
        }
        self.entries.push_back(SkippedKey {
            ratchet_key,
            keys,
            stored_at,
        });

        let mut evicted = 0;
        while self.entries.len() > capacity {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Remove and return the keys for one message.
    pub fn take(&mut self, ratchet_key: &PublicKey, counter: u32) -> Option<MessageKeys> {
        let index = self.position(ratchet_key, counter)?;
        self.entries.remove(index).map(|entry| entry.keys)
    }

    /// Drop every key belonging to one receiver chain.
    pub fn purge_chain(&mut self, ratchet_key: &PublicKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| &entry.ratchet_key != ratchet_key);
        before - self.entries.len()
    }

    /// Drop every key cached before `cutoff` (unix seconds).
    pub fn prune_older_than(&mut self, cutoff: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.stored_at >= cutoff);
        before - self.entries.len()
    }

    /// Counters cached for one chain, oldest first.
    pub fn counters_for(&self, ratchet_key: &PublicKey) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|entry| &entry.ratchet_key == ratchet_key)
            .map(|entry| entry.keys.counter())
            .collect()
    }

    fn position(&self, ratchet_key: &PublicKey, counter: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.ratchet_key == ratchet_key && entry.keys.counter() == counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::ChainKey;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_raw([byte; 32])
    }

    fn keys_at(counter: u32) -> MessageKeys {
        ChainKey::new([4u8; 32], counter).message_keys().unwrap()
    }

    #[test]
    fn take_is_single_use() {
        let mut cache = SkippedKeyCache::new();
        cache.insert(key(1), keys_at(3), 0, 10);
        assert!(cache.contains(&key(1), 3));

        let taken = cache.take(&key(1), 3).unwrap();
        assert_eq!(taken.counter(), 3);
        assert!(cache.take(&key(1), 3).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_are_scoped_by_chain() {
        let mut cache = SkippedKeyCache::new();
        cache.insert(key(1), keys_at(0), 0, 10);
        assert!(cache.take(&key(2), 0).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insert_evicts_oldest_past_capacity() {
        let mut cache = SkippedKeyCache::new();
        for counter in 0..5 {
            cache.insert(key(1), keys_at(counter), 0, 3);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.counters_for(&key(1)), vec![2, 3, 4]);
        assert_eq!(cache.insert(key(1), keys_at(5), 0, 3), 1);
        assert!(!cache.contains(&key(1), 2));
    }

    #[test]
    fn reinsert_replaces_entry() {
        let mut cache = SkippedKeyCache::new();
        cache.insert(key(1), keys_at(0), 0, 10);
        cache.insert(key(1), keys_at(0), 5, 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn purge_chain_drops_only_that_chain() {
        let mut cache = SkippedKeyCache::new();
        cache.insert(key(1), keys_at(0), 0, 10);
        cache.insert(key(1), keys_at(1), 0, 10);
        cache.insert(key(2), keys_at(0), 0, 10);
        assert_eq!(cache.purge_chain(&key(1)), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key(2), 0));
    }

    #[test]
    fn prune_by_age() {
        let mut cache = SkippedKeyCache::new();
        cache.insert(key(1), keys_at(0), 100, 10);
        cache.insert(key(1), keys_at(1), 200, 10);
        cache.insert(key(1), keys_at(2), 300, 10);
        assert_eq!(cache.prune_older_than(200), 1);
        assert_eq!(cache.counters_for(&key(1)), vec![1, 2]);
    }
}
