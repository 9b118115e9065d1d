//! RAM image cache with LRU eviction
//!
//! Provides in-memory caching of loaded images with automatic eviction
//! based on Least Recently Used (LRU) policy when the byte budget is reached.

use crate::{CacheError, CacheKey};
use imgcache_codec::PixelBuffer;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

/// What the memory tier holds for a key
#[derive(Debug, Clone)]
pub enum Payload {
    /// Decoded pixels, ready to hand out without further work
    Decoded(Arc<PixelBuffer>),

    /// Encoded bytes as fetched; decoded again on every hit
    Encoded {
        bytes: Arc<Vec<u8>>,
        mime: Option<String>,
    },
}

impl Payload {
    /// Cost of this payload for eviction accounting
    pub fn size_bytes(&self) -> usize {
        match self {
            Payload::Decoded(pixels) => pixels.byte_size(),
            Payload::Encoded { bytes, .. } => bytes.len(),
        }
    }
}

/// A cached image
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache key for this entry
    pub key: CacheKey,

    /// Cached data
    pub payload: Payload,

    /// Bytes charged against the memory limit
    pub size_bytes: usize,

    /// Last time this entry was stored or read
    pub last_access: Instant,
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries currently in cache
    pub entry_count: usize,

    /// Total memory used by cached entries (bytes)
    pub memory_used: usize,

    /// Maximum memory allowed (bytes)
    pub memory_limit: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of entries evicted due to memory pressure
    pub evictions: u64,

    /// Number of puts refused because the entry exceeded the limit
    pub rejections: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization (0.0 to 1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_limit == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_limit as f64
        }
    }
}

/// Internal cache state
struct CacheState {
    /// Map from cache key to entry
    entries: HashMap<CacheKey, CacheEntry>,

    /// LRU queue (most recently used at back, least recently used at front)
    lru_queue: VecDeque<CacheKey>,

    /// Current memory usage in bytes
    memory_used: usize,

    /// Maximum memory allowed in bytes
    memory_limit: usize,

    /// Statistics
    stats: CacheStats,
}

impl CacheState {
    fn new(memory_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            memory_used: 0,
            memory_limit,
            stats: CacheStats { memory_limit, ..Default::default() },
        }
    }

    /// Move a key to the back of the LRU queue (mark as most recently used)
    fn touch(&mut self, key: &CacheKey) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.clone());
    }

    fn detach(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.memory_used = self.memory_used.saturating_sub(entry.size_bytes);
        self.lru_queue.retain(|k| k != key);
        self.sync_stats();
        Some(entry)
    }

    /// Evict the least recently used entry
    fn evict_lru(&mut self) -> Option<CacheEntry> {
        let key = self.lru_queue.pop_front()?;
        let entry = self.entries.remove(&key)?;
        self.memory_used = self.memory_used.saturating_sub(entry.size_bytes);
        self.stats.evictions += 1;
        self.sync_stats();
        debug!(key = %key, size = entry.size_bytes, "evicted from memory cache");
        Some(entry)
    }

    /// Evict entries until `required_size` more bytes fit under the limit
    fn evict_to_fit(&mut self, required_size: usize) {
        while self.memory_used + required_size > self.memory_limit && !self.entries.is_empty() {
            if self.evict_lru().is_none() {
                break;
            }
        }
    }

    fn sync_stats(&mut self) {
        self.stats.entry_count = self.entries.len();
        self.stats.memory_used = self.memory_used;
    }
}

/// RAM image cache with LRU eviction
///
/// Thread-safe in-memory cache for loaded images. When the cache reaches
/// its memory limit, the least recently used entries are evicted
/// automatically. Entries larger than the whole limit are refused.
///
/// # Example
///
/// ```
/// use imgcache_cache::{CacheKey, Payload, RamCache};
/// use imgcache_codec::PixelBuffer;
/// use std::sync::Arc;
///
/// // Create a cache with 100MB limit
/// let cache = RamCache::new(100 * 1024 * 1024);
///
/// let key = CacheKey::new("https://example.com/cat.png");
/// let pixels = PixelBuffer::filled(256, 256, [0, 0, 0, 255]);
/// cache.put(key.clone(), Payload::Decoded(Arc::new(pixels))).unwrap();
///
/// if let Some(entry) = cache.get(&key) {
///     println!("Cache hit! {} bytes", entry.size_bytes);
/// }
///
/// let stats = cache.stats();
/// println!("Hit rate: {:.2}%", stats.hit_rate() * 100.0);
/// ```
pub struct RamCache {
    state: Arc<Mutex<CacheState>>,
}

impl RamCache {
    /// Create a new RAM cache with the specified memory limit
    ///
    /// # Arguments
    ///
    /// * `memory_limit` - Maximum memory in bytes that can be used by the cache
    pub fn new(memory_limit: usize) -> Self {
        Self { state: Arc::new(Mutex::new(CacheState::new(memory_limit))) }
    }

    /// Create a new RAM cache with a memory limit in megabytes
    pub fn with_mb_limit(megabytes: usize) -> Self {
        Self::new(megabytes * 1024 * 1024)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entry in the cache
    ///
    /// If storing this entry would exceed the memory limit, least recently
    /// used entries are evicted until there is enough space. An existing
    /// entry for `key` is replaced and becomes most recently used.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::EntryTooLarge`] if the payload alone exceeds the
    /// memory limit. Nothing is stored or evicted in that case.
    pub fn put(&self, key: CacheKey, payload: Payload) -> Result<(), CacheError> {
        let mut state = self.lock();
        let size_bytes = payload.size_bytes();

        if size_bytes > state.memory_limit {
            state.stats.rejections += 1;
            return Err(CacheError::EntryTooLarge { size: size_bytes, capacity: state.memory_limit });
        }

        state.detach(&key);
        state.evict_to_fit(size_bytes);

        state.memory_used += size_bytes;
        state.touch(&key);
        state.entries.insert(
            key.clone(),
            CacheEntry { key, payload, size_bytes, last_access: Instant::now() },
        );
        state.sync_stats();

        Ok(())
    }

    /// Retrieve an entry from the cache
    ///
    /// Returns `Some(entry)` on a hit and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.lock();

        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                let entry = entry.clone();
                state.touch(key);
                state.stats.hits += 1;
                Some(entry)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Check if an entry is in the cache without updating LRU tracking
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Remove an entry from the cache
    ///
    /// # Returns
    ///
    /// The removed entry, or `None` if it wasn't in the cache
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().detach(key)
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.lru_queue.clear();
        state.memory_used = 0;
        state.sync_stats();
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Update the memory limit
    ///
    /// If the new limit is smaller than current usage, entries are evicted
    /// until usage is below the new limit.
    pub fn set_capacity(&self, new_limit: usize) {
        let mut state = self.lock();
        state.memory_limit = new_limit;
        state.stats.memory_limit = new_limit;

        if state.memory_used > new_limit {
            state.evict_to_fit(0);
        }
    }

    /// Get the current memory limit in bytes
    pub fn capacity_bytes(&self) -> usize {
        self.lock().memory_limit
    }

    /// Get the current memory usage in bytes
    pub fn current_size_bytes(&self) -> usize {
        self.lock().memory_used
    }

    /// Get the number of entries currently in the cache
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl Default for RamCache {
    /// Create a cache with a default 256MB limit
    fn default() -> Self {
        Self::with_mb_limit(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(n: u32) -> CacheKey {
        CacheKey::new(format!("https://example.com/{n}.png"))
    }

    fn encoded(size: usize) -> Payload {
        Payload::Encoded { bytes: Arc::new(vec![0u8; size]), mime: None }
    }

    fn decoded(width: u32, height: u32) -> Payload {
        Payload::Decoded(Arc::new(PixelBuffer::filled(width, height, [1, 2, 3, 255])))
    }

    #[test]
    fn test_basic_put_get() {
        let cache = RamCache::new(1024 * 1024);

        cache.put(key(1), decoded(16, 16)).unwrap();

        let entry = cache.get(&key(1)).unwrap();
        assert_eq!(entry.key, key(1));
        assert_eq!(entry.size_bytes, 16 * 16 * 4);
        match entry.payload {
            Payload::Decoded(pixels) => assert_eq!(pixels.pixel(0, 0), Some([1, 2, 3, 255])),
            Payload::Encoded { .. } => panic!("expected decoded payload"),
        }
    }

    #[test]
    fn test_cache_miss() {
        let cache = RamCache::new(1024);

        assert!(cache.get(&key(999)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = RamCache::new(1000);

        cache.put(key(1), encoded(300)).unwrap();
        cache.put(key(2), encoded(300)).unwrap();
        cache.put(key(3), encoded(300)).unwrap();
        cache.put(key(4), encoded(300)).unwrap(); // Should evict 1

        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert!(cache.contains(&key(4)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lru_ordering() {
        let cache = RamCache::new(1000);

        cache.put(key(1), encoded(300)).unwrap();
        cache.put(key(2), encoded(300)).unwrap();
        cache.put(key(3), encoded(300)).unwrap();

        // Access 1 to make it most recently used
        cache.get(&key(1));

        // Needs 600 bytes freed: evicts 2 then 3, never 1
        cache.put(key(4), encoded(600)).unwrap();

        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(!cache.contains(&key(3)));
        assert!(cache.contains(&key(4)));
        assert!(cache.current_size_bytes() <= cache.capacity_bytes());
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = RamCache::new(1000);
        cache.put(key(1), encoded(500)).unwrap();

        let err = cache.put(key(2), encoded(1001)).unwrap_err();
        assert!(matches!(err, CacheError::EntryTooLarge { size: 1001, capacity: 1000 }));

        // Nothing was evicted or stored
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert_eq!(cache.current_size_bytes(), 500);
        assert_eq!(cache.stats().rejections, 1);
    }

    #[test]
    fn test_replace_existing_entry() {
        let cache = RamCache::new(1000);

        cache.put(key(1), encoded(100)).unwrap();
        cache.put(key(2), encoded(100)).unwrap();
        cache.put(key(1), encoded(400)).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.current_size_bytes(), 500);
        assert_eq!(cache.get(&key(1)).unwrap().size_bytes, 400);

        // 1 was refreshed by the replace, so 2 goes first
        cache.put(key(3), encoded(550)).unwrap();
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
    }

    #[test]
    fn test_remove() {
        let cache = RamCache::new(1000);
        cache.put(key(1), encoded(100)).unwrap();

        assert!(cache.remove(&key(1)).is_some());
        assert!(cache.remove(&key(1)).is_none());
        assert_eq!(cache.current_size_bytes(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = RamCache::new(1000);
        cache.put(key(1), encoded(100)).unwrap();
        cache.put(key(2), encoded(100)).unwrap();

        cache.clear();

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.current_size_bytes(), 0);
        assert!(cache.get(&key(1)).is_none());
    }

    #[test]
    fn test_stats() {
        let cache = RamCache::new(1000);
        cache.put(key(1), encoded(100)).unwrap();

        cache.get(&key(1));
        cache.get(&key(2));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.memory_utilization(), 0.1);
    }

    #[test]
    fn test_get_refreshes_last_access() {
        let cache = RamCache::new(1000);
        cache.put(key(1), encoded(100)).unwrap();

        let first = cache.get(&key(1)).unwrap().last_access;
        let second = cache.get(&key(1)).unwrap().last_access;
        assert!(second >= first);
    }

    #[test]
    fn test_set_capacity_evicts() {
        let cache = RamCache::new(1000);
        cache.put(key(1), encoded(300)).unwrap();
        cache.put(key(2), encoded(300)).unwrap();

        cache.set_capacity(400);

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key(2)));
        assert_eq!(cache.capacity_bytes(), 400);
    }

    #[test]
    fn test_random_workload_stays_within_budget() {
        let cache = RamCache::new(64 * 1024);

        for _ in 0..2_000 {
            let n = rand::random::<u32>() % 200;
            let size = 1 + rand::random::<usize>() % 8192;
            if rand::random::<bool>() {
                cache.put(key(n), encoded(size)).unwrap();
            } else {
                cache.get(&key(n));
            }
            assert!(cache.current_size_bytes() <= cache.capacity_bytes());
        }
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(RamCache::new(256 * 1024));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200 {
                        let k = key(t * 1000 + i % 50);
                        cache.put(k.clone(), encoded(1024)).unwrap();
                        cache.get(&k);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = cache.stats();
        assert!(stats.memory_used <= stats.memory_limit);
        assert_eq!(stats.entry_count, cache.len());
    }
}
