//! In-memory write buffer
//!
//! Two maps keyed by token: pending postings waiting to be appended to the
//! shard file, and pending deletions waiting to prune tombstoned postings.
//! A deleted-id set carries the record IDs whose postings are obsolete; they
//! are filtered lazily when a deletion rewrites a token's value. The buffer
//! is the only unbounded memory in the engine, so byte totals are tracked
//! and compared against the flush threshold by the owning index.

use super::idset::IdSet;
use ahash::{AHashMap, AHashSet};
use std::hash::Hash;

/// A token key held in the write buffer.
pub trait TokenKey: Eq + Hash + Ord + Clone {
    /// Approximate in-memory size of the key, for flush accounting.
    fn byte_len(&self) -> usize;
}

impl TokenKey for [u16; 2] {
    fn byte_len(&self) -> usize {
        4
    }
}

impl TokenKey for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

pub struct WriteBuffer<K: TokenKey> {
    pending: AHashMap<K, Vec<u8>>,
    pending_bytes: u64,
    deleted: AHashSet<K>,
    deleted_bytes: u64,
    dead_ids: IdSet,
}

impl<K: TokenKey> WriteBuffer<K> {
    pub fn new(dead_id_buckets: usize) -> Self {
        Self {
            pending: AHashMap::new(),
            pending_bytes: 0,
            deleted: AHashSet::new(),
            deleted_bytes: 0,
            dead_ids: IdSet::new(dead_id_buckets),
        }
    }

    /// Queue packed posting bytes for appending under `key`.
    pub fn append(&mut self, key: K, bytes: &[u8]) {
        self.pending_bytes += bytes.len() as u64;
        match self.pending.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().extend_from_slice(bytes);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                self.pending_bytes += e.key().byte_len() as u64;
                e.insert(bytes.to_vec());
            }
        }
    }

    /// Queue `key` for tombstone pruning at the next flush.
    pub fn mark_deleted(&mut self, key: K) {
        let len = key.byte_len() as u64;
        if self.deleted.insert(key) {
            self.deleted_bytes += len;
        }
    }

    /// Mark a record ID whose postings are obsolete.
    pub fn mark_dead_id(&mut self, id: u64) {
        self.dead_ids.mark(id);
    }

    pub fn is_dead_id(&self, id: u64) -> bool {
        self.dead_ids.contains(id)
    }

    pub fn clear_dead_ids(&mut self) {
        self.dead_ids.clear();
    }

    /// Total bytes queued for appending.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Total bytes of queued deletion keys.
    pub fn deleted_bytes(&self) -> u64 {
        self.deleted_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn deleted_len(&self) -> usize {
        self.deleted.len()
    }

    /// Whether a flush has anything to do.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty() || !self.deleted.is_empty()
    }

    /// Keys of the pending-append map in lexical order.
    pub fn sorted_pending_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.pending.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Remove one pending entry, returning its packed bytes.
    pub fn take_pending(&mut self, key: &K) -> Option<Vec<u8>> {
        let bytes = self.pending.remove(key)?;
        self.pending_bytes = self
            .pending_bytes
            .saturating_sub(bytes.len() as u64 + key.byte_len() as u64);
        Some(bytes)
    }

    /// Keys of the pending-delete set in lexical order.
    pub fn sorted_deleted_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.deleted.iter().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Remove one deletion entry.
    pub fn take_deleted(&mut self, key: &K) -> bool {
        if self.deleted.remove(key) {
            self.deleted_bytes = self.deleted_bytes.saturating_sub(key.byte_len() as u64);
            true
        } else {
            false
        }
    }

    /// Drop everything, including dead-id marks.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.deleted.clear();
        self.deleted_bytes = 0;
        self.dead_ids.clear();
    }
}
