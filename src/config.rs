// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detector configuration loaded from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::detector::postprocess::{
    DetectionThresholds, DEFAULT_FRAME_CONFIDENCE, DEFAULT_IMAGE_CONFIDENCE,
    DEFAULT_IOU_THRESHOLD,
};
use crate::detector::session::DEFAULT_INTRA_THREADS;
use crate::detector::variant::ModelVariant;

/// Default location of the model artifacts
pub const DEFAULT_MODEL_SOURCE: &str = "./models";

/// Default deadline for one detect call
pub const DEFAULT_DETECT_TIMEOUT_MS: u64 = 10_000;

/// Default deadline for loading an image from a URL
pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 10_000;

/// Default deadline for a whole weight download
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;

/// Configuration for the card detector
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Base URL (`http(s)://`, `file://`) or directory holding the artifacts
    pub model_source: String,
    /// Variant loaded by `ensure_ready`
    pub variant: ModelVariant,
    pub thresholds: DetectionThresholds,
    pub detect_timeout: Duration,
    pub source_timeout: Duration,
    pub fetch_timeout: Duration,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_source: DEFAULT_MODEL_SOURCE.to_string(),
            variant: ModelVariant::default(),
            thresholds: DetectionThresholds::default(),
            detect_timeout: Duration::from_millis(DEFAULT_DETECT_TIMEOUT_MS),
            source_timeout: Duration::from_millis(DEFAULT_SOURCE_TIMEOUT_MS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            intra_threads: DEFAULT_INTRA_THREADS,
        }
    }
}

impl DetectorConfig {
    /// Load configuration from environment variables
    ///
    /// Unset or unparsable values fall back to defaults; thresholds are clamped
    /// to `[0.0, 1.0]`.
    pub fn from_env() -> Self {
        Self {
            model_source: env::var("IDCARD_MODEL_SOURCE")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL_SOURCE.to_string()),
            variant: parse_env("IDCARD_MODEL_VARIANT").unwrap_or_default(),
            thresholds: DetectionThresholds {
                frame_confidence: parse_threshold(
                    "IDCARD_FRAME_CONFIDENCE",
                    DEFAULT_FRAME_CONFIDENCE,
                ),
                image_confidence: parse_threshold(
                    "IDCARD_IMAGE_CONFIDENCE",
                    DEFAULT_IMAGE_CONFIDENCE,
                ),
                iou: parse_threshold("IDCARD_IOU_THRESHOLD", DEFAULT_IOU_THRESHOLD),
            },
            detect_timeout: Duration::from_millis(
                parse_env("IDCARD_DETECT_TIMEOUT_MS").unwrap_or(DEFAULT_DETECT_TIMEOUT_MS),
            ),
            source_timeout: Duration::from_millis(
                parse_env("IDCARD_SOURCE_TIMEOUT_MS").unwrap_or(DEFAULT_SOURCE_TIMEOUT_MS),
            ),
            fetch_timeout: Duration::from_secs(
                parse_env("IDCARD_FETCH_TIMEOUT_SECS").unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            intra_threads: parse_env::<usize>("IDCARD_INTRA_THREADS")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_INTRA_THREADS),
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

fn parse_threshold(key: &str, default: f32) -> f32 {
    parse_env::<f32>(key)
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
        .unwrap_or(default)
}
