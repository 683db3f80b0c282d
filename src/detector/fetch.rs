// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model weight fetching
//!
//! Weights come either from an HTTP(S) base URL or from a local directory.
//! Both report byte-level progress so the lifecycle manager can publish a
//! download percentage.

use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use url::Url;

use super::error::DetectorError;
use super::variant::ModelVariant;

/// Progress callback: `(bytes_received, total_bytes_if_known)`
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Read size for local model files
const FILE_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest artifact accepted from any source
pub const MAX_MODEL_BYTES: u64 = 512 * 1024 * 1024;

/// Upper bound on buffer pre-allocation from a reported size
const PREALLOC_LIMIT: u64 = 64 * 1024 * 1024;

/// Default timeout for a whole weight download
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Source of model weights
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Fetch the complete weights of `variant`, reporting progress as bytes arrive
    async fn fetch(
        &self,
        variant: ModelVariant,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DetectorError>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Fetches `<base_url>/<artifact>` over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpModelFetcher {
    base_url: Url,
    client: Client,
}

impl HttpModelFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DetectorError> {
        // Url::join replaces the last segment unless the base ends in '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized).map_err(|e| {
            DetectorError::ModelFetchFailed(format!("invalid model URL {}: {}", base_url, e))
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                DetectorError::ModelFetchFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { base_url, client })
    }

    /// Full URL of a variant's artifact
    pub fn artifact_url(&self, variant: ModelVariant) -> Result<Url, DetectorError> {
        self.base_url.join(variant.file_name()).map_err(|e| {
            DetectorError::ModelFetchFailed(format!("invalid artifact URL: {}", e))
        })
    }
}

#[async_trait]
impl ModelFetcher for HttpModelFetcher {
    async fn fetch(
        &self,
        variant: ModelVariant,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DetectorError> {
        let url = self.artifact_url(variant)?;
        info!("Downloading {} detector from {}", variant, url);

        let mut response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                DetectorError::ModelFetchFailed(format!("request to {} timed out", url))
            } else {
                DetectorError::ModelFetchFailed(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectorError::ModelFetchFailed(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        let total = response.content_length();
        if let Some(total) = total {
            check_size(url.as_str(), total)?;
        }
        let mut bytes = Vec::with_capacity(initial_capacity(total));
        progress(0, total);

        while let Some(chunk) = response.chunk().await.map_err(|e| {
            DetectorError::ModelFetchFailed(format!("download of {} interrupted: {}", url, e))
        })? {
            bytes.extend_from_slice(&chunk);
            check_size(url.as_str(), bytes.len() as u64)?;
            progress(bytes.len() as u64, total);
        }

        if bytes.is_empty() {
            return Err(DetectorError::ModelFetchFailed(format!(
                "{} returned an empty body",
                url
            )));
        }

        debug!("Downloaded {} bytes for {}", bytes.len(), variant);
        Ok(bytes)
    }

    fn describe(&self) -> String {
        self.base_url.to_string()
    }
}

/// Reads artifacts from a local directory
#[derive(Debug, Clone)]
pub struct FileModelFetcher {
    dir: PathBuf,
}

impl FileModelFetcher {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn artifact_path(&self, variant: ModelVariant) -> PathBuf {
        self.dir.join(variant.file_name())
    }
}

#[async_trait]
impl ModelFetcher for FileModelFetcher {
    async fn fetch(
        &self,
        variant: ModelVariant,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DetectorError> {
        let path = self.artifact_path(variant);
        info!("Reading {} detector from {}", variant, path.display());

        let io_err = |e: std::io::Error| {
            DetectorError::ModelFetchFailed(format!("{}: {}", path.display(), e))
        };

        let mut file = tokio::fs::File::open(&path).await.map_err(io_err)?;
        let total = file.metadata().await.map_err(io_err)?.len();
        check_size(&path.display().to_string(), total)?;

        let mut bytes = Vec::with_capacity(initial_capacity(Some(total)));
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        progress(0, Some(total));

        loop {
            let n = file.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
            progress(bytes.len() as u64, Some(total));
        }

        if bytes.is_empty() {
            return Err(DetectorError::ModelFetchFailed(format!(
                "{} is empty",
                path.display()
            )));
        }

        Ok(bytes)
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Pick a fetcher for a configured model source
///
/// `http://` and `https://` use [`HttpModelFetcher`]; `file://` URLs and plain
/// paths use [`FileModelFetcher`].
pub fn fetcher_for(
    source: &str,
    timeout: Duration,
) -> Result<Arc<dyn ModelFetcher>, DetectorError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(DetectorError::ModelFetchFailed(
            "model source is empty".to_string(),
        ));
    }

    if let Ok(url) = Url::parse(source) {
        match url.scheme() {
            "http" | "https" => return Ok(Arc::new(HttpModelFetcher::new(source, timeout)?)),
            "file" => {
                let dir = url.to_file_path().map_err(|_| {
                    DetectorError::ModelFetchFailed(format!("invalid file URL {}", source))
                })?;
                return Ok(Arc::new(FileModelFetcher::new(dir)));
            }
            _ => {}
        }
    }

    Ok(Arc::new(FileModelFetcher::new(source)))
}

fn check_size(source: &str, len: u64) -> Result<(), DetectorError> {
    if len > MAX_MODEL_BYTES {
        return Err(DetectorError::ModelFetchFailed(format!(
            "{} is {} bytes, above the {} byte limit",
            source, len, MAX_MODEL_BYTES
        )));
    }
    Ok(())
}

fn initial_capacity(total: Option<u64>) -> usize {
    total.unwrap_or(0).min(PREALLOC_LIMIT) as usize
}
