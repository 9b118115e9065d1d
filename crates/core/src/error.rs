use crate::fetch::FetchError;
use imgcache_codec::{CodecError, DecodeError};

/// Why a load did not produce pixels.
///
/// Cloned to every waiter of a coalesced load, so all of them observe the
/// same failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("load was cancelled")]
    Cancelled,

    #[error("load task ended without a result")]
    Aborted,
}

/// Errors from operations that load a source and then run the codec on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
