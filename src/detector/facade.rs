// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detection facade
//!
//! [`CardDetector`] is what capture screens call. Each detect waits for the
//! model (loading it on first use), then runs preprocess, inference, decode,
//! suppression and summary on the shared session. Failures never surface as
//! errors: the caller gets a "not detected" result carrying the reason so it
//! can fall back to manual confirmation.

use image::RgbaImage;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::error::DetectorError;
use super::lifecycle::ModelLifecycleManager;
use super::postprocess::{
    decode, summarize, suppress, DetectMode, DetectionResult, DetectionThresholds,
};
use crate::config::DetectorConfig;
use crate::vision::{ImageSource, VideoFrame};

/// Detects identity cards in frames and still images
///
/// Counts as one consumer of its lifecycle manager for as long as it lives.
pub struct CardDetector {
    manager: ModelLifecycleManager,
    thresholds: DetectionThresholds,
    detect_timeout: Duration,
    source_timeout: Duration,
    client: Client,
}

impl std::fmt::Debug for CardDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardDetector")
            .field("manager", &self.manager)
            .field("thresholds", &self.thresholds)
            .field("detect_timeout", &self.detect_timeout)
            .finish_non_exhaustive()
    }
}

impl CardDetector {
    pub fn new(manager: ModelLifecycleManager, config: &DetectorConfig) -> Self {
        manager.acquire();
        Self {
            manager,
            thresholds: config.thresholds,
            detect_timeout: config.detect_timeout,
            source_timeout: config.source_timeout,
            client: Client::new(),
        }
    }

    /// Detector on the process-wide manager, configured from the environment
    pub fn from_env() -> Self {
        Self::new(ModelLifecycleManager::shared(), &DetectorConfig::from_env())
    }

    pub fn with_thresholds(mut self, thresholds: DetectionThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_detect_timeout(mut self, timeout: Duration) -> Self {
        self.detect_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &ModelLifecycleManager {
        &self.manager
    }

    pub fn thresholds(&self) -> DetectionThresholds {
        self.thresholds
    }

    /// Load the model ahead of the first detect
    pub async fn warmup(&self) -> Result<(), DetectorError> {
        self.manager.ensure_ready().await
    }

    /// Detect a card in a live video frame (lower confidence threshold)
    pub async fn detect_frame(&self, frame: VideoFrame) -> DetectionResult {
        let timestamp = frame.timestamp();
        let result = self
            .detect_pixels(frame.into_image(), DetectMode::Frame)
            .await;
        if let Some(reason) = &result.error {
            debug!("Frame at {:?} not detected: {}", timestamp, reason);
        }
        result
    }

    /// Detect a card in a captured or uploaded still image
    pub async fn detect_image(&self, source: ImageSource) -> DetectionResult {
        let kind = source.kind();
        let image = match source.load(&self.client, self.source_timeout).await {
            Ok(image) => image,
            Err(e) => {
                warn!("Failed to load {} image: {}", kind, e);
                return DetectionResult::failed(&e).with_mode(DetectMode::Image);
            }
        };
        self.detect_pixels(image, DetectMode::Image).await
    }

    /// Detect on decoded pixels; never fails, errors are carried in the result
    pub async fn detect_pixels(&self, image: RgbaImage, mode: DetectMode) -> DetectionResult {
        match self.detect(image, mode).await {
            Ok(result) => result.with_mode(mode),
            Err(e) => DetectionResult::failed(&e).with_mode(mode),
        }
    }

    async fn detect(
        &self,
        image: RgbaImage,
        mode: DetectMode,
    ) -> Result<DetectionResult, DetectorError> {
        if let Err(e) = self.manager.ensure_ready().await {
            warn!("Detector unavailable: {}", e);
            return Err(match e {
                DetectorError::NotReady(_) => e,
                other => DetectorError::NotReady(other.to_string()),
            });
        }

        let started = Instant::now();
        let confidence = self.thresholds.confidence_for(mode);
        let iou = self.thresholds.iou;

        let work = self.manager.run_exclusive(move |mut active| {
            let letterbox = active.canvas.preprocess(&image)?;
            let raw = active.session.run(active.canvas.tensor())?;
            let detections = decode(
                &raw.data,
                &raw.dims,
                active.variant.class_order(),
                confidence,
                &letterbox,
            )?;
            drop(raw);
            Ok(suppress(detections, iou))
        });

        // Work already on the blocking pool still finishes; only this caller gives up
        let detections = match tokio::time::timeout(self.detect_timeout, work).await {
            Ok(result) => result?,
            Err(_) => {
                let ms = self.detect_timeout.as_millis() as u64;
                warn!("Detection timed out after {} ms", ms);
                return Err(DetectorError::DetectTimeout(ms));
            }
        };

        let result = summarize(detections);
        debug!(
            "Detect ({:?}) in {:?}: front={} ({:.2}) back={} ({:.2}) print={} ({:.2})",
            mode,
            started.elapsed(),
            result.front_detected,
            result.front_confidence,
            result.back_detected,
            result.back_confidence,
            result.print_detected,
            result.print_confidence
        );
        Ok(result)
    }
}

impl Drop for CardDetector {
    fn drop(&mut self) {
        self.manager.release();
    }
}
