//! Image codec primitives
//!
//! Decoded pixel buffers, the blur-hash placeholder codec, and the
//! pluggable decoder registry used by the cache to turn fetched bytes
//! into pixels.

pub mod base83;
pub mod blurhash;
pub mod decoder;
mod error;
pub mod pixel;

pub use blurhash::{decode, encode, BlurHashOptions};
pub use decoder::{DecodeError, Decoder, DecoderRegistry, ImageFormat, RasterDecoder};
pub use error::CodecError;
pub use pixel::PixelBuffer;
