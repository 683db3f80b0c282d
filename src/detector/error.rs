// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error types for the card detector
//!
//! Fetch and compile failures move the lifecycle manager into its error state
//! and are broadcast to subscribers. Source, rendering and decode failures stay
//! local to a single detect call.

use thiserror::Error;

use crate::vision::ImageError;

/// Errors produced by the on-device card detector
///
/// `Clone` so a single load failure can be handed to every caller that joined
/// the same in-flight load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectorError {
    /// Network or HTTP failure while fetching model weights
    #[error("Model fetch failed: {0}")]
    ModelFetchFailed(String),

    /// Weights were fetched but the runtime rejected them
    #[error("Model compile failed: {0}")]
    ModelCompileFailed(String),

    /// No drawing surface could be prepared for preprocessing
    #[error("Rendering unavailable: {0}")]
    RenderingUnavailable(String),

    /// Input image or frame could not be decoded into pixels
    #[error("Source load failed: {0}")]
    SourceLoadFailed(String),

    /// Detection requested without a usable model
    #[error("Model not ready: {0}")]
    NotReady(String),

    /// Output tensor does not match the configured class layout
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),

    /// An in-flight load was cancelled by an unload or a different variant
    #[error("Model load superseded")]
    LoadSuperseded,

    /// Detection did not finish before its deadline
    #[error("Detection timed out after {0} ms")]
    DetectTimeout(u64),
}

impl DetectorError {
    /// Whether this failure belongs to the model lifecycle (and is recoverable
    /// by calling `load` again) rather than to a single detect call
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            DetectorError::ModelFetchFailed(_)
                | DetectorError::ModelCompileFailed(_)
                | DetectorError::LoadSuperseded
        )
    }
}

impl From<ImageError> for DetectorError {
    fn from(err: ImageError) -> Self {
        DetectorError::SourceLoadFailed(err.to_string())
    }
}
