//! Image sources

use imgcache_cache::CacheKey;
use std::collections::BTreeMap;

/// Where an image comes from and how it should be decoded.
///
/// `width` and `height` request a down-sampled decode: when both are set the
/// decoded image is shrunk to fit within `width * scale` by
/// `height * scale`, and that target size becomes part of the cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub scale: f64,
}

impl ImageSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), headers: BTreeMap::new(), width: None, height: None, scale: 1.0 }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Pixel bounds the decoded image must fit within, if down-sampling
    /// was requested. Non-finite or non-positive scales count as 1.
    pub fn target_size(&self) -> Option<(u32, u32)> {
        let (width, height) = (self.width?, self.height?);
        let scale = if self.scale.is_finite() && self.scale > 0.0 { self.scale } else { 1.0 };
        let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).max(1);
        Some((scaled(width), scaled(height)))
    }

    pub fn cache_key(&self) -> CacheKey {
        let key = CacheKey::new(self.uri.clone()).with_headers(&self.headers);
        match self.target_size() {
            Some((width, height)) => key.with_target_size(width, height),
            None => key,
        }
    }
}

impl From<&str> for ImageSource {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for ImageSource {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_size_requires_both_dimensions() {
        assert_eq!(ImageSource::new("a").target_size(), None);

        let mut only_width = ImageSource::new("a");
        only_width.width = Some(10);
        assert_eq!(only_width.target_size(), None);
    }

    #[test]
    fn test_target_size_applies_scale() {
        let source = ImageSource::new("a").with_size(100, 50).with_scale(2.0);
        assert_eq!(source.target_size(), Some((200, 100)));

        let bad_scale = ImageSource::new("a").with_size(100, 50).with_scale(f64::NAN);
        assert_eq!(bad_scale.target_size(), Some((100, 50)));
    }

    #[test]
    fn test_cache_key_ignores_unrelated_headers() {
        let plain = ImageSource::new("https://example.com/a.png");
        let authed = plain.clone().with_header("Authorization", "token");
        let negotiated = plain.clone().with_header("Accept", "image/avif");

        assert_eq!(plain.cache_key(), authed.cache_key());
        assert_ne!(plain.cache_key(), negotiated.cache_key());
    }

    #[test]
    fn test_cache_key_includes_target_size() {
        let full = ImageSource::new("a");
        let thumb = ImageSource::new("a").with_size(64, 64);

        assert_ne!(full.cache_key(), thumb.cache_key());
        assert_eq!(thumb.cache_key().target_size(), Some((64, 64)));
    }
}
