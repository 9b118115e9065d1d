//! Persistent disk cache with content-addressed storage and LRU eviction.
//!
//! Each entry is one file named after its key digest
//! (`<cache_dir>/<sha256-hex>.img`) holding the encoded image bytes as
//! fetched. Writes are staged under `<cache_dir>/tmp/` and promoted with an
//! atomic rename, so a crash mid-write never leaves a partial entry where
//! `get` can see it. Last access is persisted as the file's modification
//! time, which lets a restarted process rebuild the LRU order by scanning
//! the directory.

use crate::{CacheError, CacheKey};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "img";
const STAGING_DIR: &str = "tmp";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Statistics for monitoring disk cache performance
#[derive(Debug, Clone, Default)]
pub struct DiskCacheStats {
    /// Number of cache hits (successful retrievals)
    pub hits: u64,
    /// Number of cache misses (failed retrievals)
    pub misses: u64,
    /// Number of entries evicted to free space
    pub evictions: u64,
    /// Total number of entries in cache
    pub entry_count: usize,
    /// Total disk space used in bytes
    pub disk_used: usize,
}

impl DiskCacheStats {
    /// Calculate cache hit rate as a percentage (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate disk utilization as a percentage (0.0 to 1.0)
    pub fn disk_utilization(&self, limit: usize) -> f64 {
        if limit == 0 {
            0.0
        } else {
            self.disk_used as f64 / limit as f64
        }
    }
}

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    size: usize,
}

/// Internal cache state
struct CacheState {
    /// Map of key digests to entry files
    entries: HashMap<String, DiskEntry>,
    /// LRU queue: front = least recently used, back = most recently used
    lru_queue: VecDeque<String>,
    /// Statistics
    stats: DiskCacheStats,
    /// Disk space limit in bytes
    disk_limit: usize,
    /// Cache directory path
    cache_dir: PathBuf,
}

impl CacheState {
    /// Touch a cache entry (mark as recently used)
    fn touch(&mut self, digest: &str) {
        self.lru_queue.retain(|d| d != digest);
        self.lru_queue.push_back(digest.to_string());
    }

    fn forget(&mut self, digest: &str) -> Option<DiskEntry> {
        let entry = self.entries.remove(digest)?;
        self.lru_queue.retain(|d| d != digest);
        self.stats.disk_used = self.stats.disk_used.saturating_sub(entry.size);
        self.stats.entry_count = self.entries.len();
        Some(entry)
    }

    /// Delete one entry's file and drop it from the index
    fn evict(&mut self, digest: &str) -> io::Result<()> {
        if let Some(entry) = self.entries.get(digest) {
            remove_file_if_exists(&entry.path)?;
        }
        self.forget(digest);
        self.stats.evictions += 1;
        debug!(digest = %digest, "evicted from disk cache");
        Ok(())
    }

    /// Evict entries in LRU order until `needed_space` more bytes fit under
    /// the limit. Entries whose file cannot be deleted stay indexed and are
    /// skipped. Returns whether the space is now available.
    fn evict_until_space_available(&mut self, needed_space: usize) -> bool {
        let mut skipped = 0;
        while self.stats.disk_used + needed_space > self.disk_limit
            && skipped < self.lru_queue.len()
        {
            let digest = self.lru_queue[skipped].clone();
            if let Err(e) = self.evict(&digest) {
                warn!(digest = %digest, error = %e, "could not evict disk cache entry");
                skipped += 1;
            }
        }
        self.stats.disk_used + needed_space <= self.disk_limit
    }
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Best-effort persistence of last access time.
fn touch_mtime(path: &Path) {
    let result = File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "could not update entry mtime");
    }
}

/// Persistent disk cache for encoded image bytes
///
/// Uses content-addressed storage with LRU eviction to manage disk space.
/// Thread-safe for concurrent access from multiple threads; clones share
/// the same index.
#[derive(Clone)]
pub struct DiskCache {
    state: Arc<Mutex<CacheState>>,
}

impl DiskCache {
    /// Open (or create) a disk cache in `cache_dir` with a limit in bytes
    ///
    /// Leftover staged writes from an interrupted run are deleted and the
    /// index is rebuilt from the entry files already present.
    pub fn open<P: AsRef<Path>>(cache_dir: P, disk_limit: usize) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(cache_dir.join(STAGING_DIR))?;

        let state = CacheState {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            stats: DiskCacheStats::default(),
            disk_limit,
            cache_dir,
        };
        let cache = Self { state: Arc::new(Mutex::new(state)) };
        cache.discard_staged()?;
        cache.load_from_disk()?;
        Ok(cache)
    }

    /// Open a disk cache with the limit specified in megabytes
    pub fn with_mb_limit<P: AsRef<Path>>(cache_dir: P, megabytes: usize) -> Result<Self, CacheError> {
        Self::open(cache_dir, megabytes * 1024 * 1024)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_path(cache_dir: &Path, digest: &str) -> PathBuf {
        cache_dir.join(format!("{digest}.{ENTRY_EXTENSION}"))
    }

    fn staging_path(cache_dir: &Path, digest: &str) -> PathBuf {
        let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        cache_dir.join(STAGING_DIR).join(format!("{digest}.{}.{n}.tmp", std::process::id()))
    }

    fn stage(path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }

    /// Store bytes for `key`
    ///
    /// If the cache is full, evicts least recently used entries to make
    /// space. An existing entry for the same key is replaced.
    ///
    /// # Errors
    ///
    /// [`CacheError::EntryTooLarge`] if `bytes` alone exceeds the limit;
    /// [`CacheError::Io`] if staging or promoting the file fails. On error
    /// the previous entry for `key`, if any, is still readable.
    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        let digest = key.digest();
        let (cache_dir, disk_limit) = {
            let state = self.lock();
            (state.cache_dir.clone(), state.disk_limit)
        };

        if bytes.len() > disk_limit {
            return Err(CacheError::EntryTooLarge { size: bytes.len(), capacity: disk_limit });
        }

        let staged = Self::staging_path(&cache_dir, &digest);
        if let Err(e) = Self::stage(&staged, bytes) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }

        let mut state = self.lock();

        let previous = state.forget(&digest);
        let result = if state.evict_until_space_available(bytes.len()) {
            let path = Self::entry_path(&state.cache_dir, &digest);
            fs::rename(&staged, &path).map(|_| path)
        } else {
            Err(io::Error::other("no evictable entries left to make room"))
        };

        match result {
            Ok(path) => {
                state.entries.insert(digest.clone(), DiskEntry { path, size: bytes.len() });
                state.lru_queue.push_back(digest);
                state.stats.disk_used += bytes.len();
                state.stats.entry_count = state.entries.len();
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&staged);
                // The old file was never touched; keep serving it.
                if let Some(entry) = previous {
                    state.stats.disk_used += entry.size;
                    state.entries.insert(digest.clone(), entry);
                    state.lru_queue.push_back(digest);
                    state.stats.entry_count = state.entries.len();
                }
                Err(e.into())
            }
        }
    }

    /// Retrieve the bytes stored for `key`
    ///
    /// Returns `Ok(None)` on a miss. Updates LRU order on a hit. An entry
    /// whose file has disappeared underneath the cache counts as a miss and
    /// is dropped from the index.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let digest = key.digest();
        let mut state = self.lock();

        let Some(entry) = state.entries.get(&digest).cloned() else {
            state.stats.misses += 1;
            return Ok(None);
        };

        match fs::read(&entry.path) {
            Ok(bytes) => {
                touch_mtime(&entry.path);
                state.touch(&digest);
                state.stats.hits += 1;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key = %key, "disk cache entry vanished");
                state.forget(&digest);
                state.stats.misses += 1;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check if an entry is in the cache without updating LRU order
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(&key.digest())
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let digest = key.digest();
        let mut state = self.lock();

        let Some(path) = state.entries.get(&digest).map(|entry| entry.path.clone()) else {
            return Ok(false);
        };
        remove_file_if_exists(&path)?;
        state.forget(&digest);
        Ok(true)
    }

    /// Remove every entry
    ///
    /// Entries whose file cannot be deleted stay indexed and readable; the
    /// call then fails with [`CacheError::ClearIncomplete`] and can be
    /// retried later.
    pub fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.lock();

        let digests: Vec<String> = state.lru_queue.iter().cloned().collect();
        let mut remaining = 0;
        for digest in digests {
            let Some(path) = state.entries.get(&digest).map(|entry| entry.path.clone()) else {
                continue;
            };
            match remove_file_if_exists(&path) {
                Ok(()) => {
                    state.forget(&digest);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not remove disk cache entry");
                    remaining += 1;
                }
            }
        }

        if remaining > 0 {
            return Err(CacheError::ClearIncomplete { remaining });
        }
        info!(dir = %state.cache_dir.display(), "disk cache cleared");
        Ok(())
    }

    /// Get current cache statistics
    pub fn stats(&self) -> DiskCacheStats {
        self.lock().stats.clone()
    }

    /// Get disk space limit in bytes
    pub fn capacity_bytes(&self) -> usize {
        self.lock().disk_limit
    }

    /// Get current disk usage in bytes
    pub fn current_size_bytes(&self) -> usize {
        self.lock().stats.disk_used
    }

    /// Get number of entries in cache
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Update disk space limit
    ///
    /// If the new limit is lower than current usage, evicts entries until within limit.
    pub fn set_capacity(&self, new_limit: usize) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.disk_limit = new_limit;
        if !state.evict_until_space_available(0) {
            warn!(limit = new_limit, used = state.stats.disk_used, "disk cache still over limit");
        }
        Ok(())
    }

    /// Rebuild the index from the entry files in the cache directory
    ///
    /// Entries are ordered by modification time (oldest first, ties broken
    /// by name) and evicted if they no longer fit the limit.
    pub fn load_from_disk(&self) -> Result<(), CacheError> {
        let mut state = self.lock();

        state.entries.clear();
        state.lru_queue.clear();
        state.stats.entry_count = 0;
        state.stats.disk_used = 0;

        let mut found = Vec::new();
        for entry in fs::read_dir(&state.cache_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(digest) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }

            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, digest.to_string(), path.clone(), metadata.len() as usize));
        }

        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        for (_, digest, path, size) in found {
            state.entries.insert(digest.clone(), DiskEntry { path, size });
            state.lru_queue.push_back(digest);
            state.stats.disk_used += size;
        }
        state.stats.entry_count = state.entries.len();

        if !state.evict_until_space_available(0) {
            warn!(used = state.stats.disk_used, "disk cache still over limit after rebuild");
        }
        debug!(
            entries = state.stats.entry_count,
            bytes = state.stats.disk_used,
            "disk cache index rebuilt"
        );
        Ok(())
    }

    /// Delete staged files left behind by an interrupted write.
    fn discard_staged(&self) -> Result<(), CacheError> {
        let staging = self.lock().cache_dir.join(STAGING_DIR);
        for entry in fs::read_dir(&staging)? {
            let path = entry?.path();
            if path.is_file() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "could not remove staged file");
                }
            }
        }
        Ok(())
    }

    /// Get cache directory path
    pub fn cache_dir(&self) -> PathBuf {
        self.lock().cache_dir.clone()
    }
}
