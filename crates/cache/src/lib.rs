//! Image cache tiers
//!
//! Two-tier storage for loaded images: a bounded in-memory tier holding
//! decoded pixels (or encoded bytes) and a bounded on-disk tier holding
//! encoded bytes that survives restarts. Both evict in least-recently-used
//! order.

pub mod config;
pub mod disk;
mod error;
pub mod key;
pub mod ram;

pub use config::{CacheConfig, ConfigError, MemoryPayload};
pub use disk::{DiskCache, DiskCacheStats};
pub use error::CacheError;
pub use key::CacheKey;
pub use ram::{CacheEntry, CacheStats, Payload, RamCache};
