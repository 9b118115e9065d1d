//! Pluggable image decoders
//!
//! The cache never decodes bytes itself. It hands them to a
//! [`DecoderRegistry`], which picks a [`Decoder`] by sniffing the content
//! (falling back to the declared MIME type) and returns a [`PixelBuffer`].
//! Decoders registered later take precedence over earlier ones for the same
//! format, so an application can override the built-in raster decoder.

use crate::PixelBuffer;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Container formats the registry can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Tiff,
    Avif,
    Heic,
    Svg,
}

impl ImageFormat {
    /// Identify a format from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            return Some(Self::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(Self::Gif);
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }
        if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            return Some(Self::Tiff);
        }
        if bytes.starts_with(b"BM") && bytes.len() >= 14 {
            return Some(Self::Bmp);
        }
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            return match &bytes[8..12] {
                b"avif" | b"avis" => Some(Self::Avif),
                b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" | b"mif1" | b"msf1" => {
                    Some(Self::Heic)
                }
                _ => None,
            };
        }

        let head = &bytes[..bytes.len().min(1024)];
        let text = String::from_utf8_lossy(head);
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();
        if (trimmed.starts_with("<?xml") || trimmed.starts_with("<svg")) && trimmed.contains("<svg") {
            return Some(Self::Svg);
        }

        None
    }

    /// Map a MIME type (parameters ignored) to a format.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            "image/bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/tiff" => Some(Self::Tiff),
            "image/avif" => Some(Self::Avif),
            "image/heic" | "image/heif" => Some(Self::Heic),
            "image/svg+xml" => Some(Self::Svg),
            _ => None,
        }
    }

    /// Map a file extension to a format.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            "bmp" => Some(Self::Bmp),
            "tif" | "tiff" => Some(Self::Tiff),
            "avif" => Some(Self::Avif),
            "heic" | "heif" => Some(Self::Heic),
            "svg" => Some(Self::Svg),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
            Self::Avif => "image/avif",
            Self::Heic => "image/heic",
            Self::Svg => "image/svg+xml",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("could not determine image format")]
    Unrecognized,
    #[error("no decoder registered for {0}")]
    Unsupported(ImageFormat),
    #[error("failed to decode {format}: {message}")]
    Failed { format: ImageFormat, message: String },
}

/// A decoder for one or more image formats.
pub trait Decoder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn formats(&self) -> &[ImageFormat];

    fn decode(&self, bytes: &[u8], format: ImageFormat) -> Result<PixelBuffer, DecodeError>;
}

/// Raster decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterDecoder;

impl RasterDecoder {
    const FORMATS: [ImageFormat; 6] = [
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Gif,
        ImageFormat::WebP,
        ImageFormat::Bmp,
        ImageFormat::Tiff,
    ];

    fn backend_format(format: ImageFormat) -> Option<image::ImageFormat> {
        match format {
            ImageFormat::Png => Some(image::ImageFormat::Png),
            ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
            ImageFormat::Gif => Some(image::ImageFormat::Gif),
            ImageFormat::WebP => Some(image::ImageFormat::WebP),
            ImageFormat::Bmp => Some(image::ImageFormat::Bmp),
            ImageFormat::Tiff => Some(image::ImageFormat::Tiff),
            ImageFormat::Avif | ImageFormat::Heic | ImageFormat::Svg => None,
        }
    }
}

impl Decoder for RasterDecoder {
    fn name(&self) -> &'static str {
        "raster"
    }

    fn formats(&self) -> &[ImageFormat] {
        &Self::FORMATS
    }

    fn decode(&self, bytes: &[u8], format: ImageFormat) -> Result<PixelBuffer, DecodeError> {
        let backend = Self::backend_format(format).ok_or(DecodeError::Unsupported(format))?;
        let image = image::load_from_memory_with_format(bytes, backend)
            .map_err(|e| DecodeError::Failed { format, message: e.to_string() })?;
        Ok(PixelBuffer::from(image.to_rgba8()))
    }
}

/// Ordered set of decoders.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: Vec<Arc<dyn Decoder>>,
}

impl DecoderRegistry {
    /// An empty registry; every decode fails until decoders are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in raster decoder.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RasterDecoder));
        registry
    }

    /// Add a decoder. It wins over previously registered decoders for the
    /// formats it handles.
    pub fn register(&mut self, decoder: Arc<dyn Decoder>) {
        self.decoders.push(decoder);
    }

    pub fn supports(&self, format: ImageFormat) -> bool {
        self.decoder_for(format).is_some()
    }

    fn decoder_for(&self, format: ImageFormat) -> Option<&Arc<dyn Decoder>> {
        self.decoders.iter().rev().find(|d| d.formats().contains(&format))
    }

    /// Decode `bytes`, sniffing the format and falling back to `mime`.
    pub fn decode(&self, bytes: &[u8], mime: Option<&str>) -> Result<PixelBuffer, DecodeError> {
        let format = ImageFormat::sniff(bytes)
            .or_else(|| mime.and_then(ImageFormat::from_mime))
            .ok_or(DecodeError::Unrecognized)?;

        let decoder = self.decoder_for(format).ok_or(DecodeError::Unsupported(format))?;
        debug!(decoder = decoder.name(), %format, len = bytes.len(), "decoding image");
        decoder.decode(bytes, format)
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.decoders.iter().map(|d| d.name()).collect();
        f.debug_struct("DecoderRegistry").field("decoders", &names).finish()
    }
}
