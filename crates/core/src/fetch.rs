//! Fetch collaborators
//!
//! The manager never touches the network or filesystem for source bytes
//! itself; it goes through a [`Fetcher`]. The built-in fetchers read local
//! files and plain HTTP(S) URLs, and [`DefaultFetcher`] picks one by scheme.

use async_trait::async_trait;
use imgcache_codec::ImageFormat;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound on a single HTTP response body.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw bytes of a source plus the MIME type it was served with, if known.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("HTTP status {status} from {uri}")]
    Status { uri: String, status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
}

/// Produces the encoded bytes for a URI.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, uri: &str, headers: &BTreeMap<String, String>)
        -> Result<Fetched, FetchError>;
}

/// Lower-cased scheme of `uri`, or `None` for a bare path.
fn scheme(uri: &str) -> Option<String> {
    uri.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase())
}

/// Reads `file://` URIs and bare filesystem paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileFetcher;

impl FileFetcher {
    fn path_of(uri: &str) -> Result<PathBuf, FetchError> {
        match scheme(uri).as_deref() {
            None => Ok(PathBuf::from(uri)),
            Some("file") => Ok(PathBuf::from(&uri["file://".len()..])),
            Some(other) => Err(FetchError::UnsupportedScheme(other.to_string())),
        }
    }

    fn mime_for(path: &Path) -> Option<String> {
        let extension = path.extension()?.to_str()?;
        ImageFormat::from_extension(extension).map(|format| format.mime().to_string())
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(
        &self,
        uri: &str,
        _headers: &BTreeMap<String, String>,
    ) -> Result<Fetched, FetchError> {
        let path = Self::path_of(uri)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FetchError::NotFound(uri.to_string())
            } else {
                FetchError::Io { path: path.display().to_string(), message: e.to_string() }
            }
        })?;

        debug!(path = %path.display(), len = bytes.len(), "read local image");
        Ok(Fetched { mime: Self::mime_for(&path), bytes })
    }
}

/// Fetches `http://` and `https://` URIs with a blocking `ureq` agent on
/// the blocking thread pool.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { agent: ureq::AgentBuilder::new().timeout(timeout).build() }
    }

    fn fetch_blocking(
        agent: &ureq::Agent,
        uri: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Fetched, FetchError> {
        let request = headers
            .iter()
            .fold(agent.get(uri), |request, (name, value)| request.set(name, value));

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Err(FetchError::NotFound(uri.to_string())),
            Err(ureq::Error::Status(status, _)) => {
                return Err(FetchError::Status { uri: uri.to_string(), status })
            }
            Err(other) => return Err(FetchError::Transport(other.to_string())),
        };

        let mime = response
            .header("content-type")
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_BODY_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        debug!(uri, len = bytes.len(), "downloaded image");
        Ok(Fetched { bytes, mime })
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        uri: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Fetched, FetchError> {
        match scheme(uri).as_deref() {
            Some("http" | "https") => {}
            Some(other) => return Err(FetchError::UnsupportedScheme(other.to_string())),
            None => return Err(FetchError::UnsupportedScheme(String::new())),
        }

        let agent = self.agent.clone();
        let uri = uri.to_string();
        let headers = headers.clone();
        tokio::task::spawn_blocking(move || Self::fetch_blocking(&agent, &uri, &headers))
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?
    }
}

/// Routes each URI to the file or HTTP fetcher by scheme.
#[derive(Debug, Clone, Default)]
pub struct DefaultFetcher {
    file: FileFetcher,
    http: HttpFetcher,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fetcher for DefaultFetcher {
    async fn fetch(
        &self,
        uri: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Fetched, FetchError> {
        match scheme(uri).as_deref() {
            None | Some("file") => self.file.fetch(uri, headers).await,
            Some("http" | "https") => self.http.fetch(uri, headers).await,
            Some(other) => Err(FetchError::UnsupportedScheme(other.to_string())),
        }
    }
}
