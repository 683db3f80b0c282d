// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! On-device identity card detection
//!
//! This module provides:
//! - Letterbox preprocessing into the detector's square input tensor
//! - Decoding, per-class NMS and scene summaries of raw detector output
//! - A single-instance model lifecycle (fetch, compile, ready, unload)
//! - The `CardDetector` facade used by capture screens
//!
//! Inference runs on CPU via ONNX Runtime.

pub mod error;
pub mod facade;
pub mod fetch;
pub mod lifecycle;
pub mod postprocess;
pub mod session;
pub mod tensor_codec;
pub mod variant;

pub use error::DetectorError;
pub use facade::CardDetector;
pub use fetch::{fetcher_for, FileModelFetcher, HttpModelFetcher, ModelFetcher, ProgressFn};
pub use lifecycle::{ActiveSession, ModelLifecycleManager, ModelState, ModelStatus, Subscription};
pub use postprocess::{
    decode, summarize, suppress, BoundingBox, DetectMode, Detection, DetectionResult,
    DetectionThresholds,
};
pub use session::{InferenceBackend, InferenceSession, OrtBackend, RawOutput};
pub use tensor_codec::{postprocess_box, preprocess, Letterbox, LetterboxCanvas};
pub use variant::{CardClass, ModelVariant, CARD_CLASS_ORDER};
