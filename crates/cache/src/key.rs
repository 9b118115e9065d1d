//! Cache keys
//!
//! A key identifies one logical image: the source URI plus anything that
//! changes the bytes or pixels the cache would hold for it (content
//! negotiation headers, the target decode size when down-sampling).

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Request headers that select a different representation of the same URI.
pub const NEGOTIATION_HEADERS: [&str; 2] = ["accept", "accept-language"];

/// Identity of a cached image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    uri: String,
    headers: BTreeMap<String, String>,
    target_size: Option<(u32, u32)>,
}

impl CacheKey {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), headers: BTreeMap::new(), target_size: None }
    }

    /// Record a request header. Headers that do not affect content
    /// negotiation are ignored; names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.trim().to_ascii_lowercase();
        if NEGOTIATION_HEADERS.contains(&name.as_str()) {
            self.headers.insert(name, value.into());
        }
        self
    }

    pub fn with_headers<'a, I>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        headers.into_iter().fold(self, |key, (name, value)| key.with_header(name, value.clone()))
    }

    /// Mark the key as a down-sampled variant of the source.
    pub fn with_target_size(mut self, width: u32, height: u32) -> Self {
        self.target_size = Some((width, height));
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn target_size(&self) -> Option<(u32, u32)> {
        self.target_size
    }

    /// Stable textual form the digest is computed from.
    pub fn canonical(&self) -> String {
        let mut out = self.uri.clone();
        for (name, value) in &self.headers {
            out.push('\n');
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        if let Some((width, height)) = self.target_size {
            out.push_str(&format!("\n@{width}x{height}"));
        }
        out
    }

    /// Filesystem-safe name for this key: SHA-256 of the canonical form, hex encoded.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)?;
        if let Some((width, height)) = self.target_size {
            write!(f, " @{width}x{height}")?;
        }
        Ok(())
    }
}
