//! Cache manager
//!
//! Orchestrates the memory and disk tiers around a fetcher and a decoder
//! registry. Concurrent requests for the same key share one load (a
//! "flight"): the first request registers the flight and spawns it, later
//! requests subscribe to its result. When every waiter has gone away before
//! the flight resolves, its cancellation token fires.
//!
//! Lock order is registry, then memory tier. Disk I/O and decoding never
//! run under the registry lock.

use crate::cancel::CancellationToken;
use crate::fetch::{DefaultFetcher, Fetcher};
use crate::{ImageError, ImageSource, LoadError};
use imgcache_cache::{
    CacheConfig, CacheKey, CacheStats, DiskCache, DiskCacheStats, MemoryPayload, Payload,
    RamCache,
};
use imgcache_codec::{blurhash, BlurHashOptions, CodecError, DecoderRegistry, PixelBuffer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a load as seen by every waiter.
pub type LoadResult = Result<Arc<PixelBuffer>, LoadError>;

/// Observable state of a source in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// A load is in flight.
    Pending,
    /// Held by the memory or disk tier.
    Ready,
    /// The last load failed and the failure is still inside its grace window.
    Failed,
}

struct Flight {
    id: u64,
    read_disk: bool,
    token: CancellationToken,
    waiters: AtomicUsize,
    detached: AtomicBool,
    result: watch::Sender<Option<LoadResult>>,
}

impl Flight {
    fn new(id: u64, read_disk: bool) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            id,
            read_disk,
            token: CancellationToken::new(),
            waiters: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
            result,
        }
    }

    fn is_resolved(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// A detached flight still answers its waiters but must not touch the tiers.
    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn publish(&self, outcome: LoadResult) {
        self.result.send_replace(Some(outcome));
    }
}

struct Failure {
    error: LoadError,
    at: Instant,
}

#[derive(Default)]
struct Registry {
    flights: HashMap<CacheKey, Arc<Flight>>,
    /// Per key, detached flights and invalidations that have not finished
    /// yet. New flights for these keys skip the disk tier.
    detached: HashMap<CacheKey, usize>,
    failures: HashMap<CacheKey, Failure>,
    next_id: u64,
}

impl Registry {
    /// Keep new flights for `key` off the disk tier until a matching
    /// [`release_disk`](Registry::release_disk).
    fn hold_disk(&mut self, key: &CacheKey) {
        *self.detached.entry(key.clone()).or_insert(0) += 1;
    }

    fn release_disk(&mut self, key: &CacheKey) {
        if let Some(count) = self.detached.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.detached.remove(key);
            }
        }
    }

    fn detach(&mut self, key: &CacheKey, flight: &Flight) {
        if !flight.detached.swap(true, Ordering::AcqRel) {
            self.hold_disk(key);
        }
        if self.flights.get(key).is_some_and(|f| f.id == flight.id) {
            self.flights.remove(key);
        }
    }

    /// Called once by the flight's own task when it has finished with the tiers.
    fn retire(&mut self, key: &CacheKey, flight: &Flight) {
        if self.flights.get(key).is_some_and(|f| f.id == flight.id) {
            self.flights.remove(key);
        }
        if flight.is_detached() {
            self.release_disk(key);
        }
    }

    fn recent_failure(&mut self, key: &CacheKey, grace: Duration) -> Option<LoadError> {
        let failure = self.failures.get(key)?;
        if failure.at.elapsed() < grace {
            return Some(failure.error.clone());
        }
        self.failures.remove(key);
        None
    }

    fn live_flight(&self, key: &CacheKey) -> Option<&Arc<Flight>> {
        self.flights.get(key).filter(|flight| !flight.token.is_cancelled())
    }
}

struct Loaded {
    pixels: PixelBuffer,
    bytes: Arc<Vec<u8>>,
    mime: Option<String>,
    from_disk: bool,
}

struct Inner {
    config: CacheConfig,
    memory: RamCache,
    disk: Option<DiskCache>,
    fetcher: Arc<dyn Fetcher>,
    decoders: Arc<DecoderRegistry>,
    registry: Mutex<Registry>,
    prefetch_slots: Arc<Semaphore>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn decode(
        &self,
        bytes: Arc<Vec<u8>>,
        mime: Option<String>,
        target: Option<(u32, u32)>,
    ) -> Result<PixelBuffer, LoadError> {
        let decoders = Arc::clone(&self.decoders);
        tokio::task::spawn_blocking(move || -> Result<PixelBuffer, LoadError> {
            let pixels = decoders.decode(&bytes, mime.as_deref())?;
            Ok(match target {
                Some((width, height)) => pixels.fit_within(width, height),
                None => pixels,
            })
        })
        .await
        .map_err(|_| LoadError::Aborted)?
    }

    async fn disk_get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let disk = self.disk.clone()?;
        let lookup = key.clone();
        match tokio::task::spawn_blocking(move || disk.get(&lookup)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) => {
                warn!(%key, %error, "disk read failed, treating as miss");
                None
            }
            Err(error) => {
                warn!(%key, %error, "disk read task failed");
                None
            }
        }
    }

    async fn disk_put(&self, key: &CacheKey, bytes: Arc<Vec<u8>>) -> bool {
        let Some(disk) = self.disk.clone() else {
            return false;
        };
        let target = key.clone();
        match tokio::task::spawn_blocking(move || disk.put(&target, &bytes)).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                warn!(%key, %error, "failed to persist image");
                false
            }
            Err(error) => {
                warn!(%key, %error, "disk write task failed");
                false
            }
        }
    }

    async fn disk_remove(&self, key: &CacheKey) {
        let Some(disk) = self.disk.clone() else {
            return;
        };
        let target = key.clone();
        match tokio::task::spawn_blocking(move || disk.remove(&target)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => warn!(%key, %error, "failed to remove disk entry"),
            Err(error) => warn!(%key, %error, "disk remove task failed"),
        }
    }

    fn store_in_memory(
        &self,
        key: &CacheKey,
        pixels: &Arc<PixelBuffer>,
        bytes: &Arc<Vec<u8>>,
        mime: Option<String>,
    ) {
        let payload = match self.config.memory_payload {
            MemoryPayload::Decoded => Payload::Decoded(Arc::clone(pixels)),
            MemoryPayload::Encoded => Payload::Encoded { bytes: Arc::clone(bytes), mime },
        };
        if let Err(error) = self.memory.put(key.clone(), payload) {
            debug!(%key, %error, "memory tier refused entry");
        }
    }

    async fn memory_hit(&self, key: &CacheKey) -> Option<Arc<PixelBuffer>> {
        let entry = self.memory.get(key)?;
        match entry.payload {
            Payload::Decoded(pixels) => Some(pixels),
            Payload::Encoded { bytes, mime } => {
                match self.decode(bytes, mime, key.target_size()).await {
                    Ok(pixels) => Some(Arc::new(pixels)),
                    Err(error) => {
                        warn!(%key, %error, "dropping undecodable memory entry");
                        self.memory.remove(key);
                        None
                    }
                }
            }
        }
    }

    /// Disk tier, then fetcher.
    async fn load(
        &self,
        source: &ImageSource,
        key: &CacheKey,
        read_disk: bool,
    ) -> Result<Loaded, LoadError> {
        if read_disk {
            if let Some(bytes) = self.disk_get(key).await {
                let bytes = Arc::new(bytes);
                match self.decode(Arc::clone(&bytes), None, key.target_size()).await {
                    Ok(pixels) => {
                        debug!(%key, "disk hit");
                        return Ok(Loaded { pixels, bytes, mime: None, from_disk: true });
                    }
                    Err(error) => {
                        warn!(%key, %error, "discarding undecodable disk entry");
                        self.disk_remove(key).await;
                    }
                }
            }
        }

        debug!(%key, "fetching");
        let fetched = self.fetcher.fetch(&source.uri, &source.headers).await?;
        let bytes = Arc::new(fetched.bytes);
        let pixels = self.decode(Arc::clone(&bytes), fetched.mime.clone(), key.target_size()).await?;
        Ok(Loaded { pixels, bytes, mime: fetched.mime, from_disk: false })
    }

    /// Populate memory then disk, unless the flight was detached meanwhile.
    async fn complete(&self, key: &CacheKey, flight: &Flight, loaded: Loaded) -> Arc<PixelBuffer> {
        let pixels = Arc::new(loaded.pixels);

        let stored = {
            let mut registry = self.registry();
            if flight.is_detached() {
                false
            } else {
                registry.failures.remove(key);
                self.store_in_memory(key, &pixels, &loaded.bytes, loaded.mime);
                true
            }
        };

        let persisted = stored && !loaded.from_disk && self.disk_put(key, loaded.bytes).await;
        if !persisted {
            self.registry().retire(key, flight);
            return pixels;
        }

        let detached = {
            let mut registry = self.registry();
            let detached = flight.is_detached();
            if !detached {
                registry.retire(key, flight);
            }
            detached
        };
        if detached {
            debug!(%key, "invalidated while persisting, removing disk entry");
            self.disk_remove(key).await;
            self.registry().retire(key, flight);
        }
        pixels
    }

    fn fail(&self, key: &CacheKey, flight: &Flight, error: &LoadError) {
        let grace = self.config.failure_grace;
        let mut registry = self.registry();
        let transient = matches!(error, LoadError::Cancelled | LoadError::Aborted);
        if !flight.is_detached() && !transient && !grace.is_zero() {
            registry.failures.retain(|_, failure| failure.at.elapsed() < grace);
            registry.failures.insert(key.clone(), Failure { error: error.clone(), at: Instant::now() });
        }
        registry.retire(key, flight);
    }
}

/// Publishes `Aborted` and retires the flight if its task unwinds or is
/// dropped before producing a result.
struct FlightGuard<'a> {
    inner: &'a Inner,
    key: &'a CacheKey,
    flight: &'a Flight,
    published: bool,
}

impl FlightGuard<'_> {
    fn publish(mut self, outcome: LoadResult) {
        self.published = true;
        self.flight.publish(outcome);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        warn!(key = %self.key, "load task aborted");
        self.inner.fail(self.key, self.flight, &LoadError::Aborted);
        self.flight.publish(Err(LoadError::Aborted));
    }
}

async fn run_flight(inner: Arc<Inner>, source: ImageSource, key: CacheKey, flight: Arc<Flight>) {
    let guard = FlightGuard { inner: &inner, key: &key, flight: &flight, published: false };
    let outcome = tokio::select! {
        biased;
        _ = flight.token.cancelled() => Err(LoadError::Cancelled),
        loaded = inner.load(&source, &key, flight.read_disk) => loaded,
    };

    let result = match outcome {
        Ok(loaded) => Ok(inner.complete(&key, &flight, loaded).await),
        Err(error) => {
            match &error {
                LoadError::Cancelled => debug!(%key, "load cancelled"),
                other => debug!(%key, error = %other, "load failed"),
            }
            inner.fail(&key, &flight, &error);
            Err(error)
        }
    };
    guard.publish(result);
}

/// One caller's interest in a flight.
struct Waiter {
    inner: Arc<Inner>,
    key: CacheKey,
    flight: Arc<Flight>,
}

impl Waiter {
    /// Must be called with the registry lock held.
    fn join(inner: &Arc<Inner>, key: &CacheKey, flight: &Arc<Flight>) -> Self {
        flight.waiters.fetch_add(1, Ordering::AcqRel);
        Self { inner: Arc::clone(inner), key: key.clone(), flight: Arc::clone(flight) }
    }

    async fn wait(&self) -> LoadResult {
        let mut receiver = self.flight.result.subscribe();
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(LoadError::Aborted)),
            Err(_) => Err(LoadError::Aborted),
        };
        outcome
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let _registry = self.inner.registry();
        let remaining = self.flight.waiters.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining == 0 && !self.flight.is_resolved() {
            debug!(key = %self.key, "last waiter left, cancelling load");
            self.flight.token.cancel();
        }
    }
}

enum Admission {
    Wait(Waiter),
    Failed(LoadError),
    InMemory,
}

/// Two-tier image cache with single-flight loading.
///
/// Cheap to clone; clones share tiers and in-flight loads. Every async
/// method, and [`prefetch`](CacheManager::prefetch), must be called from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl CacheManager {
    /// Build a manager with both tiers.
    ///
    /// A disk tier that cannot be opened is logged and skipped; the manager
    /// then runs memory-only. A disk size of zero disables the disk tier.
    pub fn new(config: CacheConfig, fetcher: Arc<dyn Fetcher>, decoders: DecoderRegistry) -> Self {
        let disk = if config.disk_cache_size == 0 {
            None
        } else {
            match DiskCache::open(&config.disk_cache_dir, config.disk_cache_size) {
                Ok(disk) => Some(disk),
                Err(error) => {
                    warn!(
                        dir = %config.disk_cache_dir.display(),
                        %error,
                        "disk cache unavailable, running memory-only"
                    );
                    None
                }
            }
        };
        Self::with_tiers(config, disk, fetcher, decoders)
    }

    /// Build a manager with no disk tier.
    pub fn memory_only(
        config: CacheConfig,
        fetcher: Arc<dyn Fetcher>,
        decoders: DecoderRegistry,
    ) -> Self {
        Self::with_tiers(config, None, fetcher, decoders)
    }

    /// Build a manager using the file/HTTP fetcher and the built-in decoders.
    pub fn with_defaults(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(DefaultFetcher::new()), DecoderRegistry::with_defaults())
    }

    fn with_tiers(
        config: CacheConfig,
        disk: Option<DiskCache>,
        fetcher: Arc<dyn Fetcher>,
        decoders: DecoderRegistry,
    ) -> Self {
        info!(
            memory_bytes = config.memory_cache_size,
            disk_bytes = disk.as_ref().map_or(0, DiskCache::capacity_bytes),
            payload = %config.memory_payload,
            "image cache ready"
        );
        let inner = Inner {
            memory: RamCache::new(config.memory_cache_size),
            prefetch_slots: Arc::new(Semaphore::new(config.prefetch_concurrency.max(1))),
            disk,
            fetcher,
            decoders: Arc::new(decoders),
            registry: Mutex::new(Registry::default()),
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn has_disk_tier(&self) -> bool {
        self.inner.disk.is_some()
    }

    /// Load `source`, from memory if possible, otherwise by joining or
    /// starting a flight.
    ///
    /// Every caller coalesced onto one flight receives the same `Arc` or
    /// the same error. Dropping the returned future withdraws this caller;
    /// the flight is cancelled once nobody is left waiting on it.
    pub async fn request(&self, source: &ImageSource) -> LoadResult {
        let key = source.cache_key();
        loop {
            if let Some(pixels) = self.inner.memory_hit(&key).await {
                debug!(%key, "memory hit");
                return Ok(pixels);
            }
            match self.admit(source, &key) {
                Admission::Wait(waiter) => return waiter.wait().await,
                Admission::Failed(error) => return Err(error),
                Admission::InMemory => continue,
            }
        }
    }

    fn admit(&self, source: &ImageSource, key: &CacheKey) -> Admission {
        let mut registry = self.inner.registry();

        if let Some(error) = registry.recent_failure(key, self.inner.config.failure_grace) {
            debug!(%key, "failed recently, not retrying yet");
            return Admission::Failed(error);
        }
        if let Some(flight) = registry.live_flight(key) {
            debug!(%key, "joining in-flight load");
            return Admission::Wait(Waiter::join(&self.inner, key, flight));
        }
        // A flight may have finished between the memory lookup and taking the lock.
        if self.inner.memory.contains(key) {
            return Admission::InMemory;
        }

        if let Some(cancelled) = registry.flights.get(key).cloned() {
            registry.detach(key, &cancelled);
        }
        registry.next_id += 1;
        let read_disk = !registry.detached.contains_key(key);
        let flight = Arc::new(Flight::new(registry.next_id, read_disk));
        registry.flights.insert(key.clone(), Arc::clone(&flight));

        // The task cannot retire the flight before the registry lock is released.
        tokio::spawn(run_flight(
            Arc::clone(&self.inner),
            source.clone(),
            key.clone(),
            Arc::clone(&flight),
        ));
        Admission::Wait(Waiter::join(&self.inner, key, &flight))
    }

    /// Warm the cache for `source` in the background.
    ///
    /// The result is discarded and failures are logged. The returned handle
    /// can be awaited or ignored.
    pub fn prefetch(&self, source: ImageSource) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&manager.inner.prefetch_slots).acquire_owned().await else {
                return;
            };
            match manager.request(&source).await {
                Ok(_) => debug!(uri = %source.uri, "prefetched"),
                Err(error) => warn!(uri = %source.uri, %error, "prefetch failed"),
            }
        })
    }

    pub fn prefetch_many<I>(&self, sources: I) -> Vec<JoinHandle<()>>
    where
        I: IntoIterator,
        I::Item: Into<ImageSource>,
    {
        sources.into_iter().map(|source| self.prefetch(source.into())).collect()
    }

    /// Forget `source` in both tiers along with any remembered failure.
    ///
    /// A load already in flight still answers its current waiters but no
    /// longer populates the cache; the next request starts a fresh load.
    pub async fn invalidate(&self, source: &ImageSource) {
        let key = source.cache_key();
        {
            let mut registry = self.inner.registry();
            registry.failures.remove(&key);
            if let Some(flight) = registry.flights.get(&key).cloned() {
                registry.detach(&key, &flight);
            }
            registry.hold_disk(&key);
            self.inner.memory.remove(&key);
        }
        self.inner.disk_remove(&key).await;
        self.inner.registry().release_disk(&key);
        debug!(%key, "invalidated");
    }

    pub fn clear_memory_cache(&self) {
        self.inner.memory.clear();
        info!("memory cache cleared");
    }

    /// Remove every disk entry. Returns `false` if some files could not be
    /// deleted; those entries stay indexed and readable.
    pub async fn clear_disk_cache(&self) -> bool {
        let Some(disk) = self.inner.disk.clone() else {
            return true;
        };
        match tokio::task::spawn_blocking(move || disk.clear()).await {
            Ok(Ok(())) => {
                info!("disk cache cleared");
                true
            }
            Ok(Err(error)) => {
                warn!(%error, "disk cache only partially cleared");
                false
            }
            Err(error) => {
                warn!(%error, "disk clear task failed");
                false
            }
        }
    }

    pub fn state(&self, source: &ImageSource) -> Option<EntryState> {
        let key = source.cache_key();
        if self.inner.memory.contains(&key) {
            return Some(EntryState::Ready);
        }
        {
            let mut registry = self.inner.registry();
            if registry.live_flight(&key).is_some() {
                return Some(EntryState::Pending);
            }
            if registry.recent_failure(&key, self.inner.config.failure_grace).is_some() {
                return Some(EntryState::Failed);
            }
        }
        self.inner.disk.as_ref().filter(|disk| disk.contains(&key)).map(|_| EntryState::Ready)
    }

    /// Load `source` through the cache and compute its blur hash.
    pub async fn encode_blur_hash(
        &self,
        source: &ImageSource,
        components_x: u32,
        components_y: u32,
    ) -> Result<String, ImageError> {
        if !(1..=9).contains(&components_x) || !(1..=9).contains(&components_y) {
            return Err(CodecError::InvalidDimensions(format!(
                "components must be within 1..=9, got {components_x}x{components_y}"
            ))
            .into());
        }

        let pixels = self.request(source).await?;
        let hash = tokio::task::spawn_blocking(move || {
            blurhash::encode(&pixels, components_x, components_y)
        })
        .await
        .map_err(|_| LoadError::Aborted)??;
        Ok(hash)
    }

    pub fn decode_blur_hash(&self, options: &BlurHashOptions) -> Result<PixelBuffer, CodecError> {
        options.decode()
    }

    pub fn memory_stats(&self) -> CacheStats {
        self.inner.memory.stats()
    }

    pub fn disk_stats(&self) -> Option<DiskCacheStats> {
        self.inner.disk.as_ref().map(DiskCache::stats)
    }
}
