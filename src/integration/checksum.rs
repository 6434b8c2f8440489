//! Source archive checksums.
//!
//! The pin records the SHA-256 of the upstream source archive for the pinned
//! commit. Archives are streamed through the hasher, never held in memory.

use std::collections::HashMap;
use std::io::{self, Read};
use std::time::Duration;

use reqwest::blocking::Client;
use sha2::{Digest, Sha256};

use crate::steps::StepError;

const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
// Archives of large upstreams take a while on slow links.
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Opens the byte stream of a source archive.
pub trait ArchiveSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read>, StepError>;
}

/// Downloads archives over HTTP(S).
pub struct HttpArchiveSource {
    client: Client,
}

impl HttpArchiveSource {
    pub fn new() -> Result<Self, StepError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("pinroll/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StepError::Runtime(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl ArchiveSource for HttpArchiveSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read>, StepError> {
        tracing::info!(url, "downloading source archive");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| StepError::Runtime(format!("failed to download {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StepError::Runtime(format!(
                "failed to download {url}: HTTP {} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown error")
            )));
        }
        Ok(Box::new(response))
    }
}

/// Serves fixed archive bodies keyed by URL.
#[derive(Debug, Default, Clone)]
pub struct StaticArchiveSource {
    archives: HashMap<String, Vec<u8>>,
}

impl StaticArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.archives.insert(url.into(), body.into());
        self
    }
}

impl ArchiveSource for StaticArchiveSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read>, StepError> {
        match self.archives.get(url) {
            Some(body) => Ok(Box::new(io::Cursor::new(body.clone()))),
            None => Err(StepError::Runtime(format!("no archive served at {url}"))),
        }
    }
}

/// Hex-encoded SHA-256 of everything `reader` yields.
pub fn sha256_hex(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Checksum of the archive behind `url`.
pub fn archive_checksum(source: &dyn ArchiveSource, url: &str) -> Result<String, StepError> {
    let reader = source.open(url)?;
    sha256_hex(reader).map_err(|e| StepError::Io {
        context: format!("reading archive {url}"),
        source: e,
    })
}
