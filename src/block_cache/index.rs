//! Sharded block-cache index.
//!
//! Maps a key hash to the on-device location of its newest entry. 64-way
//! sharded: reads take a shard read lock, mutations the write lock, and
//! point operations touch exactly one shard. The conditional operations
//! (`remove_if_points_at`, `replace_if_points_at`) exist for the reclaim
//! path, which must not clobber an entry that a racing insert or remove
//! already superseded.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::INDEX_SHARD_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub region: u32,
    pub offset: u32,
    pub generation: u32,
    pub hits: u8,
}

impl IndexEntry {
    /// Same physical location, ignoring the hit counter.
    fn points_at(&self, region: u32, generation: u32, offset: u32) -> bool {
        self.region == region && self.generation == generation && self.offset == offset
    }
}

pub(crate) struct Index {
    shards: Vec<RwLock<HashMap<u64, IndexEntry>>>,
}

impl Index {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..INDEX_SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    #[inline]
    fn shard(&self, hash: u64) -> &RwLock<HashMap<u64, IndexEntry>> {
        &self.shards[(hash % INDEX_SHARD_COUNT as u64) as usize]
    }

    pub(crate) fn get(&self, hash: u64) -> Option<IndexEntry> {
        self.shard(hash).read().get(&hash).copied()
    }

    /// Inserts and returns the displaced entry, if any.
    pub(crate) fn insert(&self, hash: u64, entry: IndexEntry) -> Option<IndexEntry> {
        self.shard(hash).write().insert(hash, entry)
    }

    pub(crate) fn remove(&self, hash: u64) -> Option<IndexEntry> {
        self.shard(hash).write().remove(&hash)
    }

    /// Removes the entry only if it still points at the given location.
    /// Returns whether a removal happened.
    pub(crate) fn remove_if_points_at(
        &self,
        hash: u64,
        region: u32,
        generation: u32,
        offset: u32,
    ) -> bool {
        let mut shard = self.shard(hash).write();
        match shard.get(&hash) {
            Some(entry) if entry.points_at(region, generation, offset) => {
                shard.remove(&hash);
                true
            }
            _ => false,
        }
    }

    /// Replaces the entry only if it still points at `(region, generation,
    /// offset)`. This is the serialization point between a reclaim reinsert
    /// and a racing insert or remove of the same key.
    pub(crate) fn replace_if_points_at(
        &self,
        hash: u64,
        region: u32,
        generation: u32,
        offset: u32,
        new_entry: IndexEntry,
    ) -> bool {
        let mut shard = self.shard(hash).write();
        match shard.get_mut(&hash) {
            Some(entry) if entry.points_at(region, generation, offset) => {
                *entry = new_entry;
                true
            }
            _ => false,
        }
    }

    /// Saturating hit bump; best-effort and not durable.
    pub(crate) fn record_hit(&self, hash: u64) -> u8 {
        let mut shard = self.shard(hash).write();
        match shard.get_mut(&hash) {
            Some(entry) => {
                entry.hits = entry.hits.saturating_add(1);
                entry.hits
            }
            None => 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub(crate) fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<(u64, IndexEntry)> {
        let mut all = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let shard = shard.read();
            all.extend(shard.iter().map(|(&h, &e)| (h, e)));
        }
        all
    }

    pub(crate) fn restore(&self, entries: impl IntoIterator<Item = (u64, IndexEntry)>) {
        self.clear();
        for (hash, entry) in entries {
            self.insert(hash, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(region: u32, offset: u32, generation: u32) -> IndexEntry {
        IndexEntry {
            region,
            offset,
            generation,
            hits: 0,
        }
    }

    #[test]
    fn insert_returns_displaced_entry() {
        let index = Index::new();
        assert!(index.insert(1, entry(0, 64, 1)).is_none());
        let old = index.insert(1, entry(2, 128, 1)).unwrap();
        assert_eq!(old.region, 0);
        assert_eq!(index.get(1).unwrap().region, 2);
    }

    #[test]
    fn conditional_remove_respects_location() {
        let index = Index::new();
        index.insert(9, entry(3, 64, 7));

        assert!(!index.remove_if_points_at(9, 3, 6, 64), "stale generation");
        assert!(index.get(9).is_some());
        assert!(index.remove_if_points_at(9, 3, 7, 64));
        assert!(index.get(9).is_none());
    }

    #[test]
    fn conditional_replace_is_a_cas() {
        let index = Index::new();
        index.insert(9, entry(3, 64, 7));

        // A racing overwrite moved the key; the reinsert must lose.
        index.insert(9, entry(5, 256, 2));
        assert!(!index.replace_if_points_at(9, 3, 7, 64, entry(4, 0, 1)));
        assert_eq!(index.get(9).unwrap().region, 5);

        assert!(index.replace_if_points_at(9, 5, 2, 256, entry(4, 0, 1)));
        assert_eq!(index.get(9).unwrap().region, 4);
    }

    #[test]
    fn hits_saturate() {
        let index = Index::new();
        index.insert(1, entry(0, 64, 1));
        for _ in 0..300 {
            index.record_hit(1);
        }
        assert_eq!(index.get(1).unwrap().hits, u8::MAX);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let index = Index::new();
        for i in 0..500u64 {
            index.insert(i, entry(i as u32 % 8, 64 * i as u32, 1));
        }
        let snap = index.snapshot();
        assert_eq!(snap.len(), 500);

        let restored = Index::new();
        restored.restore(snap);
        assert_eq!(restored.len(), 500);
        assert_eq!(restored.get(123).unwrap().offset, 64 * 123);
    }
}
