// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detector inputs: live video frames and still-image sources

use image::RgbaImage;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::image_utils::{decode_base64_image, decode_image_bytes, rgba_from_raw, ImageError};
use crate::detector::error::DetectorError;

/// A still image to run detection on
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Encoded bytes of an uploaded file
    File(Vec<u8>),
    /// Encoded image on disk
    Path(PathBuf),
    /// `data:` URL, bare base64, or `http(s)://` URL
    Url(String),
    /// Already-decoded pixels
    Pixels(RgbaImage),
}

impl ImageSource {
    /// Resolve the source into RGBA pixels
    ///
    /// `timeout` bounds the HTTP request of a remote URL.
    pub async fn load(self, client: &Client, timeout: Duration) -> Result<RgbaImage, DetectorError> {
        match self {
            ImageSource::File(bytes) => decode_blocking(move || decode_image_bytes(&bytes)).await,
            ImageSource::Path(path) => load_path(path).await,
            ImageSource::Url(url) => load_url(url, client, timeout).await,
            ImageSource::Pixels(image) => {
                if image.width() == 0 || image.height() == 0 {
                    return Err(ImageError::ZeroSized.into());
                }
                Ok(image)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImageSource::File(_) => "file",
            ImageSource::Path(_) => "path",
            ImageSource::Url(_) => "url",
            ImageSource::Pixels(_) => "pixels",
        }
    }
}

impl From<RgbaImage> for ImageSource {
    fn from(image: RgbaImage) -> Self {
        ImageSource::Pixels(image)
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

async fn decode_blocking<F>(decode: F) -> Result<RgbaImage, DetectorError>
where
    F: FnOnce() -> Result<RgbaImage, ImageError> + Send + 'static,
{
    tokio::task::spawn_blocking(decode)
        .await
        .map_err(|e| DetectorError::SourceLoadFailed(format!("decode task failed: {}", e)))?
        .map_err(DetectorError::from)
}

async fn load_path(path: PathBuf) -> Result<RgbaImage, DetectorError> {
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| DetectorError::SourceLoadFailed(format!("{}: {}", path.display(), e)))?;
    decode_blocking(move || decode_image_bytes(&bytes)).await
}

async fn load_url(url: String, client: &Client, timeout: Duration) -> Result<RgbaImage, DetectorError> {
    let trimmed = url.trim();

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        debug!("Fetching image from {}", trimmed);
        let response = client
            .get(trimmed)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| DetectorError::SourceLoadFailed(format!("request to {} failed: {}", trimmed, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectorError::SourceLoadFailed(format!(
                "{} returned HTTP {}",
                trimmed, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DetectorError::SourceLoadFailed(format!("reading {} failed: {}", trimmed, e)))?;
        return decode_blocking(move || decode_image_bytes(&bytes)).await;
    }

    if let Some(path) = trimmed.strip_prefix("file://") {
        return load_path(PathBuf::from(path)).await;
    }

    // data: URL or bare base64
    decode_blocking(move || decode_base64_image(&url)).await
}

/// One RGBA frame grabbed from a live camera stream
#[derive(Debug, Clone)]
pub struct VideoFrame {
    image: RgbaImage,
    timestamp: Duration,
}

impl VideoFrame {
    /// Wrap a raw RGBA buffer; its length must be `width * height * 4`
    pub fn new(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        timestamp: Duration,
    ) -> Result<Self, DetectorError> {
        let image = rgba_from_raw(width, height, pixels)?;
        Ok(Self { image, timestamp })
    }

    pub fn from_image(image: RgbaImage, timestamp: Duration) -> Self {
        Self { image, timestamp }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Capture time relative to the start of the stream
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}
