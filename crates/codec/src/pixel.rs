//! Decoded RGBA pixel buffers

use crate::CodecError;
use image::{imageops, imageops::FilterType, RgbaImage};

/// A decoded image: row-major RGBA samples, 4 bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGBA samples, checking that the length matches the dimensions.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, CodecError> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(CodecError::BufferSize { expected, actual: pixels.len() });
        }
        Ok(Self { width, height, pixels })
    }

    /// A buffer filled with one color.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 4);
        for _ in 0..count {
            pixels.extend_from_slice(&rgba);
        }
        Self { width, height, pixels }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Memory cost of the pixel data in bytes
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// RGBA of the pixel at `(x, y)`, or `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let mut rgba = [0u8; 4];
        rgba.copy_from_slice(&self.pixels[offset..offset + 4]);
        Some(rgba)
    }

    /// Down-sample so the image fits within `max_width` x `max_height`.
    ///
    /// Aspect ratio is preserved and the image is never enlarged; a buffer
    /// that already fits is returned unchanged.
    pub fn fit_within(self, max_width: u32, max_height: u32) -> Self {
        if self.is_empty() || max_width == 0 || max_height == 0 {
            return self;
        }
        if self.width <= max_width && self.height <= max_height {
            return self;
        }

        let ratio = f64::min(
            max_width as f64 / self.width as f64,
            max_height as f64 / self.height as f64,
        );
        let width = ((self.width as f64 * ratio).round() as u32).max(1);
        let height = ((self.height as f64 * ratio).round() as u32).max(1);

        let image = self.into_rgba_image();
        let resized = imageops::resize(&image, width, height, FilterType::Triangle);
        Self::from(resized)
    }

    pub fn into_rgba_image(self) -> RgbaImage {
        // Length is validated on construction.
        RgbaImage::from_raw(self.width, self.height, self.pixels)
            .unwrap_or_else(|| RgbaImage::new(0, 0))
    }
}

impl From<RgbaImage> for PixelBuffer {
    fn from(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height, pixels: image.into_raw() }
    }
}
