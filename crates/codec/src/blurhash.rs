//! Blur-hash placeholder codec
//!
//! Encodes a decoded image into a short base-83 string holding a truncated
//! cosine transform of the image, and decodes such a string back into a
//! small placeholder bitmap. Quantisation constants and packing order match
//! the reference blur-hash implementations so strings are portable across
//! ecosystems.
//!
//! Layout of a hash with `cx * cy` components:
//!
//! ```text
//! [size flag: 1][max AC: 1][DC: 4][AC: 2 * (cx * cy - 1)]
//! ```

use crate::{base83, CodecError, PixelBuffer};
use std::f64::consts::PI;
use std::sync::OnceLock;

/// Options for materialising a placeholder from a hash.
///
/// Defaults mirror what image views use when no explicit size is given:
/// a 32x32 bitmap with unmodified contrast.
#[derive(Debug, Clone, PartialEq)]
pub struct BlurHashOptions {
    pub hash: String,
    pub width: u32,
    pub height: u32,
    pub punch: f64,
}

impl BlurHashOptions {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into(), width: 32, height: 32, punch: 1.0 }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_punch(mut self, punch: f64) -> Self {
        self.punch = punch;
        self
    }

    pub fn decode(&self) -> Result<PixelBuffer, CodecError> {
        decode(&self.hash, self.width, self.height, self.punch)
    }
}

/// Encode `image` with `components_x` x `components_y` cosine components.
///
/// # Errors
///
/// `InvalidDimensions` if either component count is outside `1..=9`,
/// `EmptyImage` if the image has no pixels.
pub fn encode(
    image: &PixelBuffer,
    components_x: u32,
    components_y: u32,
) -> Result<String, CodecError> {
    if !(1..=9).contains(&components_x) || !(1..=9).contains(&components_y) {
        return Err(CodecError::InvalidDimensions(format!(
            "components must be within 1..=9, got {components_x}x{components_y}"
        )));
    }
    if image.is_empty() {
        return Err(CodecError::EmptyImage);
    }

    let width = image.width() as usize;
    let height = image.height() as usize;
    let pixels = image.pixels();
    let lut = srgb_to_linear_table();

    let cos_x = cosine_table(components_x as usize, width);
    let cos_y = cosine_table(components_y as usize, height);
    let scale = 1.0 / (width * height) as f64;

    let mut factors = Vec::with_capacity((components_x * components_y) as usize);
    for j in 0..components_y as usize {
        for i in 0..components_x as usize {
            let normalisation = if i == 0 && j == 0 { 1.0 } else { 2.0 };
            let mut sum = [0.0f64; 3];
            for y in 0..height {
                let basis_y = cos_y[j * height + y];
                let row = y * width;
                for x in 0..width {
                    let basis = normalisation * cos_x[i * width + x] * basis_y;
                    let offset = (row + x) * 4;
                    sum[0] += basis * lut[pixels[offset] as usize];
                    sum[1] += basis * lut[pixels[offset + 1] as usize];
                    sum[2] += basis * lut[pixels[offset + 2] as usize];
                }
            }
            factors.push([sum[0] * scale, sum[1] * scale, sum[2] * scale]);
        }
    }

    let dc = factors[0];
    let ac = &factors[1..];
    let mut hash = String::with_capacity(4 + 2 * factors.len());

    let size_flag = (components_x - 1) + (components_y - 1) * 9;
    base83::encode_into(size_flag, 1, &mut hash);

    let maximum_value = if ac.is_empty() {
        base83::encode_into(0, 1, &mut hash);
        1.0
    } else {
        let actual_maximum = ac
            .iter()
            .flat_map(|factor| factor.iter())
            .fold(0.0f64, |max, value| max.max(value.abs()));
        let quantised = (actual_maximum * 166.0 - 0.5).floor().clamp(0.0, 82.0) as u32;
        base83::encode_into(quantised, 1, &mut hash);
        (quantised + 1) as f64 / 166.0
    };

    base83::encode_into(encode_dc(dc), 4, &mut hash);
    for factor in ac {
        base83::encode_into(encode_ac(*factor, maximum_value), 2, &mut hash);
    }

    Ok(hash)
}

/// Decode `hash` into a `width` x `height` RGBA placeholder.
///
/// `punch` scales the AC contribution; `1.0` reproduces the encoded
/// contrast and `0.0` yields a flat image of the average color.
///
/// # Errors
///
/// `MalformedHash` on a bad length or characters outside the alphabet,
/// `InvalidDimensions` if either output dimension is zero, `InvalidPunch`
/// for a negative or non-finite punch.
pub fn decode(hash: &str, width: u32, height: u32, punch: f64) -> Result<PixelBuffer, CodecError> {
    if width == 0 || height == 0 {
        return Err(CodecError::InvalidDimensions(format!(
            "output size must be non-zero, got {width}x{height}"
        )));
    }
    if !punch.is_finite() || punch < 0.0 {
        return Err(CodecError::InvalidPunch(punch));
    }

    let (components_x, components_y) = components(hash)?;
    let digits = |range: std::ops::Range<usize>| {
        base83::decode(&hash[range.clone()]).ok_or_else(|| {
            CodecError::MalformedHash(format!("invalid character in {:?}", &hash[range]))
        })
    };

    let quantised_maximum = digits(1..2)?;
    let maximum_value = (quantised_maximum + 1) as f64 / 166.0 * punch;

    let count = (components_x * components_y) as usize;
    let mut colors = Vec::with_capacity(count);
    colors.push(decode_dc(digits(2..6)?));
    for k in 1..count {
        let start = 4 + k * 2;
        colors.push(decode_ac(digits(start..start + 2)?, maximum_value));
    }

    let cx = components_x as usize;
    let cy = components_y as usize;
    let w = width as usize;
    let h = height as usize;

    // Indexed [position * components + component].
    let mut cos_x = vec![0.0f64; w * cx];
    for x in 0..w {
        for i in 0..cx {
            cos_x[x * cx + i] = (PI * x as f64 * i as f64 / width as f64).cos();
        }
    }
    let mut cos_y = vec![0.0f64; h * cy];
    for y in 0..h {
        for j in 0..cy {
            cos_y[y * cy + j] = (PI * y as f64 * j as f64 / height as f64).cos();
        }
    }

    let mut pixels = Vec::with_capacity(w * h * 4);
    for y in 0..h {
        for x in 0..w {
            let mut sum = [0.0f64; 3];
            for j in 0..cy {
                for i in 0..cx {
                    let basis = cos_x[x * cx + i] * cos_y[y * cy + j];
                    let color = colors[i + j * cx];
                    sum[0] += color[0] * basis;
                    sum[1] += color[1] * basis;
                    sum[2] += color[2] * basis;
                }
            }
            pixels.push(linear_to_srgb(sum[0]));
            pixels.push(linear_to_srgb(sum[1]));
            pixels.push(linear_to_srgb(sum[2]));
            pixels.push(255);
        }
    }

    PixelBuffer::new(width, height, pixels)
}

/// Component counts encoded in `hash`, after validating its length.
pub fn components(hash: &str) -> Result<(u32, u32), CodecError> {
    if !hash.is_ascii() {
        return Err(CodecError::MalformedHash("hash must be ASCII".to_string()));
    }
    if hash.len() < 6 {
        return Err(CodecError::MalformedHash(format!(
            "hash must be at least 6 characters, got {}",
            hash.len()
        )));
    }

    let size_flag = base83::decode(&hash[0..1])
        .ok_or_else(|| CodecError::MalformedHash("invalid size flag".to_string()))?;
    if size_flag > 80 {
        return Err(CodecError::MalformedHash(format!("size flag {size_flag} out of range")));
    }
    let components_x = size_flag % 9 + 1;
    let components_y = size_flag / 9 + 1;

    let expected = 4 + 2 * (components_x * components_y) as usize;
    if hash.len() != expected {
        return Err(CodecError::MalformedHash(format!(
            "expected {expected} characters for {components_x}x{components_y} components, got {}",
            hash.len()
        )));
    }

    Ok((components_x, components_y))
}

/// The average (DC) color of a hash as 8-bit sRGB.
pub fn average_color(hash: &str) -> Result<[u8; 3], CodecError> {
    components(hash)?;
    let value = base83::decode(&hash[2..6])
        .ok_or_else(|| CodecError::MalformedHash("invalid average color".to_string()))?;
    Ok([(value >> 16) as u8, (value >> 8) as u8, value as u8])
}

fn encode_dc(color: [f64; 3]) -> u32 {
    let r = linear_to_srgb(color[0]) as u32;
    let g = linear_to_srgb(color[1]) as u32;
    let b = linear_to_srgb(color[2]) as u32;
    (r << 16) + (g << 8) + b
}

fn encode_ac(color: [f64; 3], maximum_value: f64) -> u32 {
    let quantise = |value: f64| {
        (sign_pow(value / maximum_value, 0.5) * 9.0 + 9.5).floor().clamp(0.0, 18.0) as u32
    };
    quantise(color[0]) * 19 * 19 + quantise(color[1]) * 19 + quantise(color[2])
}

fn decode_dc(value: u32) -> [f64; 3] {
    [
        srgb_to_linear((value >> 16) as u8),
        srgb_to_linear((value >> 8) as u8),
        srgb_to_linear(value as u8),
    ]
}

fn decode_ac(value: u32, maximum_value: f64) -> [f64; 3] {
    let quant_r = (value / (19 * 19)) as f64;
    let quant_g = ((value / 19) % 19) as f64;
    let quant_b = (value % 19) as f64;
    [
        sign_pow((quant_r - 9.0) / 9.0, 2.0) * maximum_value,
        sign_pow((quant_g - 9.0) / 9.0, 2.0) * maximum_value,
        sign_pow((quant_b - 9.0) / 9.0, 2.0) * maximum_value,
    ]
}

/// `cos(pi * k * p / len)` for each component `k` and position `p`,
/// indexed `[k * len + p]`.
fn cosine_table(components: usize, len: usize) -> Vec<f64> {
    let mut table = vec![0.0f64; components * len];
    for k in 0..components {
        for p in 0..len {
            table[k * len + p] = (PI * k as f64 * p as f64 / len as f64).cos();
        }
    }
    table
}

fn srgb_to_linear_table() -> &'static [f64; 256] {
    static TABLE: OnceLock<[f64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0f64; 256];
        for (value, slot) in table.iter_mut().enumerate() {
            *slot = srgb_to_linear(value as u8);
        }
        table
    })
}

fn srgb_to_linear(value: u8) -> f64 {
    let v = value as f64 / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f64) -> u8 {
    let v = value.clamp(0.0, 1.0);
    if v <= 0.0031308 {
        (v * 12.92 * 255.0 + 0.5).trunc() as u8
    } else {
        ((1.055 * v.powf(1.0 / 2.4) - 0.055) * 255.0 + 0.5).trunc() as u8
    }
}

fn sign_pow(value: f64, exponent: f64) -> f64 {
    value.abs().powf(exponent).copysign(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE_HASH: &str = "LEHV6nWB2yk8pyo0adR*.7kCMdnj";

    fn gradient(width: u32, height: u32) -> PixelBuffer {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[(x * 8) as u8, (y * 10) as u8, 128, 255]);
            }
        }
        PixelBuffer::new(width, height, pixels).unwrap()
    }

    #[test]
    fn test_encode_known_gradient() {
        let image = gradient(32, 24);
        assert_eq!(encode(&image, 4, 3).unwrap(), "LxH27k2swxX8mHWWjtf7gJfjfQfj");
        assert_eq!(encode(&image, 1, 1).unwrap(), "00H27k");
    }

    #[test]
    fn test_encode_is_deterministic() {
        let image = gradient(32, 24);
        assert_eq!(encode(&image, 5, 4).unwrap(), encode(&image, 5, 4).unwrap());
    }

    #[test]
    fn test_encode_length_for_every_component_count() {
        let image = gradient(8, 8);
        for cx in 1..=9 {
            for cy in 1..=9 {
                let hash = encode(&image, cx, cy).unwrap();
                assert_eq!(hash.len(), (4 + 2 * cx * cy) as usize, "{cx}x{cy}");
                assert_eq!(components(&hash).unwrap(), (cx, cy));
            }
        }
    }

    #[test]
    fn test_encode_rejects_component_counts() {
        let image = gradient(4, 4);
        assert!(matches!(encode(&image, 0, 3), Err(CodecError::InvalidDimensions(_))));
        assert!(matches!(encode(&image, 4, 10), Err(CodecError::InvalidDimensions(_))));
    }

    #[test]
    fn test_encode_rejects_empty_image() {
        let image = PixelBuffer::new(0, 12, Vec::new()).unwrap();
        assert_eq!(encode(&image, 4, 3), Err(CodecError::EmptyImage));
    }

    #[test]
    fn test_decode_reference_hash() {
        let image = decode(REFERENCE_HASH, 32, 32, 1.0).unwrap();
        assert_eq!(image.width(), 32);
        assert_eq!(image.height(), 32);
        assert_eq!(image.pixel(0, 0), Some([135, 164, 177, 255]));
        assert_eq!(image.pixel(31, 31), Some([133, 142, 147, 255]));
    }

    #[test]
    fn test_reference_hash_average_color() {
        let dc = average_color(REFERENCE_HASH).unwrap();
        assert_eq!(dc, [151, 150, 149]);

        let image = decode(REFERENCE_HASH, 32, 32, 1.0).unwrap();
        let count = (image.width() * image.height()) as f64;
        for channel in 0..3 {
            let mean = image.pixels().iter().skip(channel).step_by(4).map(|&v| v as f64).sum::<f64>()
                / count;
            assert!((mean - dc[channel] as f64).abs() < 3.0, "channel {channel}: {mean}");
        }
    }

    #[test]
    fn test_zero_punch_flattens_to_average() {
        let image = decode(REFERENCE_HASH, 6, 6, 0.0).unwrap();
        assert!(image.pixels().chunks(4).all(|px| px == [151, 150, 149, 255]));
    }

    #[test]
    fn test_solid_color_round_trip() {
        let image = PixelBuffer::filled(8, 8, [200, 100, 50, 255]);
        let hash = encode(&image, 1, 1).unwrap();
        assert_eq!(hash, "00M|T9");

        let decoded = decode(&hash, 8, 8, 1.0).unwrap();
        assert!(decoded.pixels().chunks(4).all(|px| px == [200, 100, 50, 255]));
    }

    #[test]
    fn test_gradient_round_trip_keeps_direction() {
        let hash = encode(&gradient(32, 24), 4, 3).unwrap();
        let decoded = decode(&hash, 32, 24, 1.0).unwrap();

        let top_left = decoded.pixel(0, 0).unwrap();
        let bottom_right = decoded.pixel(31, 23).unwrap();
        assert_eq!(top_left, [0, 78, 142, 255]);
        assert_eq!(bottom_right, [218, 196, 112, 255]);
        assert!(top_left[0] < bottom_right[0]);
        assert!(top_left[1] < bottom_right[1]);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let truncated = &REFERENCE_HASH[..REFERENCE_HASH.len() - 2];
        assert!(matches!(decode(truncated, 32, 32, 1.0), Err(CodecError::MalformedHash(_))));
        assert!(matches!(decode("L", 32, 32, 1.0), Err(CodecError::MalformedHash(_))));
    }

    #[test]
    fn test_decode_rejects_invalid_characters() {
        let bad = REFERENCE_HASH.replace('W', "\"");
        assert!(matches!(decode(&bad, 32, 32, 1.0), Err(CodecError::MalformedHash(_))));

        let non_ascii = format!("{}é", &REFERENCE_HASH[..REFERENCE_HASH.len() - 2]);
        assert!(matches!(decode(&non_ascii, 32, 32, 1.0), Err(CodecError::MalformedHash(_))));
    }

    #[test]
    fn test_decode_rejects_zero_size_and_bad_punch() {
        assert!(matches!(decode(REFERENCE_HASH, 0, 32, 1.0), Err(CodecError::InvalidDimensions(_))));
        assert!(matches!(decode(REFERENCE_HASH, 32, 32, -1.0), Err(CodecError::InvalidPunch(_))));
        assert!(matches!(
            decode(REFERENCE_HASH, 32, 32, f64::NAN),
            Err(CodecError::InvalidPunch(_))
        ));
    }

    #[test]
    fn test_options_defaults() {
        let options = BlurHashOptions::new(REFERENCE_HASH);
        assert_eq!((options.width, options.height, options.punch), (32, 32, 1.0));

        let placeholder = options.with_size(8, 4).decode().unwrap();
        assert_eq!((placeholder.width(), placeholder.height()), (8, 4));
    }
}
