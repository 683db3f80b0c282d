// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod cli;
pub mod config;
pub mod detector;
pub mod version;
pub mod vision;

pub use config::DetectorConfig;
pub use detector::{
    CardClass, CardDetector, DetectMode, Detection, DetectionResult, DetectorError,
    ModelLifecycleManager, ModelState, ModelVariant,
};
pub use vision::{ImageSource, VideoFrame};
