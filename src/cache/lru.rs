//! Thread-safe LRU cache of decoded table blocks.
//!
//! Blocks are keyed by `(cache_id, file_num, offset)` so several readers can share
//! one cache. Entries are `Bytes`, so a hit hands out a reference-counted view of
//! the block and eviction never invalidates a block an iterator still holds.

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one block inside the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Namespace allocated by [`BlockCache::new_id`].
    pub cache_id: u64,
    /// File number of the table.
    pub file_num: u64,
    /// Offset of the block within the file.
    pub offset: u64,
}

impl CacheKey {
    pub fn new(cache_id: u64, file_num: u64, offset: u64) -> Self {
        Self { cache_id, file_num, offset }
    }
}

/// Counters of cache activity since creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Block lookups.
    pub lookups: u64,
    /// Lookups that found the block.
    pub hits: u64,
    /// Lookups that did not.
    pub misses: u64,
    /// Blocks inserted.
    pub insertions: u64,
    /// Blocks evicted to stay within capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<CacheKey, (Bytes, u64)>,
    // Access tick -> key; the smallest tick is the least recently used.
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
    size: usize,
    stats: CacheStats,
}

impl LruState {
    fn bump(&mut self, key: CacheKey, old_tick: u64) -> u64 {
        self.order.remove(&old_tick);
        self.tick += 1;
        self.order.insert(self.tick, key);
        self.tick
    }

    fn evict_one(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some((value, _)) = self.entries.remove(&key) {
            self.size -= value.len();
            self.stats.evictions += 1;
        }
        true
    }
}

/// Thread-safe LRU cache for table blocks, bounded by total bytes.
///
/// A capacity of zero disables caching: every lookup misses and inserts are
/// dropped.
#[derive(Debug)]
pub struct BlockCache {
    capacity: usize,
    next_id: AtomicU64,
    state: Mutex<LruState>,
}

impl BlockCache {
    /// Creates a cache holding up to `capacity` bytes of blocks.
    ///
    /// ```
    /// use lsmtable::cache::BlockCache;
    ///
    /// let cache = BlockCache::new(8 * 1024 * 1024);
    /// assert_eq!(cache.capacity(), 8 * 1024 * 1024);
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self { capacity, next_id: AtomicU64::new(1), state: Mutex::new(LruState::default()) }
    }

    /// Allocates a fresh namespace for a reader's blocks.
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up a block, marking it most recently used on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut state = self.state.lock();
        state.stats.lookups += 1;
        match state.entries.get(key).map(|(v, t)| (v.clone(), *t)) {
            Some((value, tick)) => {
                let tick = state.bump(*key, tick);
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.1 = tick;
                }
                state.stats.hits += 1;
                Some(value)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Inserts a block, evicting least recently used blocks to make room.
    ///
    /// Blocks larger than the whole capacity are not cached.
    pub fn insert(&self, key: CacheKey, value: Bytes) {
        let value_size = value.len();
        if self.capacity == 0 || value_size > self.capacity {
            return;
        }

        let mut state = self.state.lock();
        if let Some((old, tick)) = state.entries.remove(&key) {
            state.size -= old.len();
            state.order.remove(&tick);
        }
        while state.size + value_size > self.capacity {
            if !state.evict_one() {
                break;
            }
        }
        state.tick += 1;
        let tick = state.tick;
        state.order.insert(tick, key);
        state.entries.insert(key, (value, tick));
        state.size += value_size;
        state.stats.insertions += 1;
    }

    /// Drops every block cached for one file of one namespace.
    pub fn evict_file(&self, cache_id: u64, file_num: u64) {
        let mut state = self.state.lock();
        let victims: Vec<(CacheKey, u64)> = state
            .entries
            .iter()
            .filter(|(k, _)| k.cache_id == cache_id && k.file_num == file_num)
            .map(|(k, (_, t))| (*k, *t))
            .collect();
        for (key, tick) in &victims {
            state.order.remove(tick);
            if let Some((value, _)) = state.entries.remove(key) {
                state.size -= value.len();
                state.stats.evictions += 1;
            }
        }
        if !victims.is_empty() {
            debug!("evicted {} blocks of file {} (cache id {})", victims.len(), file_num, cache_id);
        }
    }

    /// A snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }

    /// Drops every cached block.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.size = 0;
    }

    /// Bytes of cached blocks.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Capacity in bytes; zero disables caching.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if no block is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
