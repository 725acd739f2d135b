//! Descriptor table identity keys and the collision-tolerant table cache

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Identity of a descriptor table: one id per slot, at most `N` slots
///
/// Shader resource tables use view sequence numbers, sampler tables use stable
/// sampler ids. Unused trailing entries are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableKey<const N: usize> {
    len: usize,
    ids: [u64; N],
}

impl<const N: usize> TableKey<N> {
    /// Build a key from per-slot ids
    ///
    /// # Panics
    ///
    /// If more than `N` ids are supplied.
    pub fn from_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        let mut key = Self { len: 0, ids: [0; N] };
        for id in ids {
            assert!(key.len < N, "descriptor table key holds at most {N} slots");
            key.ids[key.len] = id;
            key.len += 1;
        }
        key
    }

    /// Number of slots
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the key names an empty table
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Per-slot ids
    pub fn ids(&self) -> &[u64] {
        &self.ids[..self.len]
    }

    fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Largest shader resource table
pub const MAX_SHADER_RESOURCE_SLOTS: usize = 128;

/// Largest sampler table
pub const MAX_SAMPLER_SLOTS: usize = 16;

/// Key of a shader resource view table
pub type SrvTableKey = TableKey<MAX_SHADER_RESOURCE_SLOTS>;

/// Key of a sampler table
pub type SamplerTableKey = TableKey<MAX_SAMPLER_SLOTS>;

/// Direct-mapped key → heap slot cache
///
/// A new entry simply evicts whatever hashed to the same bucket, so lookups can
/// miss for tables that were cached earlier. A hit always compares the full key,
/// so a different table is never returned.
#[derive(Debug)]
pub struct TableCache<const N: usize> {
    entries: Vec<Option<(TableKey<N>, u32)>>,
    mask: u64,
    hits: u64,
    misses: u64,
}

impl<const N: usize> TableCache<N> {
    /// Create a cache with `buckets` rounded up to a power of two
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        Self {
            entries: vec![None; buckets],
            mask: buckets as u64 - 1,
            hits: 0,
            misses: 0,
        }
    }

    /// Heap slot previously cached for `key`
    pub fn lookup(&mut self, key: &TableKey<N>) -> Option<u32> {
        let bucket = self.bucket(key);
        match &self.entries[bucket] {
            Some((cached, slot)) if cached == key => {
                self.hits += 1;
                Some(*slot)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Remember that `key` lives at `slot`
    pub fn insert(&mut self, key: TableKey<N>, slot: u32) {
        let bucket = self.bucket(&key);
        self.entries[bucket] = Some((key, slot));
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
    }

    /// Number of occupied buckets
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }

    /// Lookups that found their key
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    /// Lookups that did not
    pub const fn misses(&self) -> u64 {
        self.misses
    }

    fn bucket(&self, key: &TableKey<N>) -> usize {
        (key.hash_value() & self.mask) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Key = TableKey<4>;

    #[test]
    fn test_key_compares_prefix_and_length() {
        let short = Key::from_ids([1, 2]);
        let padded = Key::from_ids([1, 2, 0]);
        assert_ne!(short, padded);
        assert_eq!(short.ids(), &[1, 2]);
    }

    #[test]
    #[should_panic(expected = "at most 4 slots")]
    fn test_key_overflow_panics() {
        let _ = Key::from_ids([1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let mut cache = TableCache::<4>::new(8);
        let key = Key::from_ids([7, 8]);
        assert_eq!(cache.lookup(&key), None);

        cache.insert(key, 42);
        assert_eq!(cache.lookup(&key), Some(42));
        assert_eq!(cache.lookup(&Key::from_ids([7, 9])), None);
        assert_eq!((cache.hits(), cache.misses()), (1, 2));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(&key), None);
    }

    #[test]
    fn test_collisions_never_return_wrong_slot() {
        // A single bucket forces every key to collide
        let mut cache = TableCache::<4>::new(1);
        let first = Key::from_ids([1]);
        let second = Key::from_ids([2]);

        cache.insert(first, 10);
        cache.insert(second, 20);
        assert_eq!(cache.lookup(&first), None);
        assert_eq!(cache.lookup(&second), Some(20));
        assert_eq!(cache.len(), 1);
    }
}
