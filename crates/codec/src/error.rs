/// Errors produced by the pure codec operations.
///
/// All of these describe bad caller input; none of them is worth retrying.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("malformed blur hash: {0}")]
    MalformedHash(String),
    #[error("punch must be a finite non-negative number, got {0}")]
    InvalidPunch(f64),
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}
