//! Image cache core
//!
//! The [`CacheManager`] ties the memory and disk tiers from
//! `imgcache-cache` to a [`Fetcher`] and the decoder registry from
//! `imgcache-codec`, and adds single-flight loading, prefetch,
//! invalidation and blur-hash helpers on top.

pub mod cancel;
mod error;
pub mod fetch;
pub mod manager;
pub mod source;

pub use cancel::CancellationToken;
pub use error::{ImageError, LoadError};
pub use fetch::{DefaultFetcher, FetchError, Fetched, Fetcher, FileFetcher, HttpFetcher};
pub use manager::{CacheManager, EntryState, LoadResult};
pub use source::ImageSource;

pub use imgcache_cache::{CacheConfig, CacheStats, DiskCacheStats, MemoryPayload};
pub use imgcache_codec::{BlurHashOptions, CodecError, DecodeError, DecoderRegistry, PixelBuffer};
