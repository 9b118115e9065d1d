use std::io;

/// Errors raised by the cache tiers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },
    #[error("disk cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{remaining} disk cache entries could not be removed")]
    ClearIncomplete { remaining: usize },
}
