// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detection post-processing
//!
//! - `decode` turns the raw `[1, 4 + classes, candidates]` output into
//!   detections in original-image coordinates
//! - `suppress` runs per-class greedy NMS
//! - `summarize` reduces the survivors to a scene-level [`DetectionResult`]

use serde::{Deserialize, Serialize};
use tracing::{debug, enabled, Level};

use super::error::DetectorError;
use super::tensor_codec::Letterbox;
use super::variant::CardClass;

/// Confidence threshold for live video frames (blurrier, noisier input)
pub const DEFAULT_FRAME_CONFIDENCE: f32 = 0.15;

/// Confidence threshold for captured or uploaded still images
pub const DEFAULT_IMAGE_CONFIDENCE: f32 = 0.25;

/// IoU above which same-class detections are suppressed
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Number of leading rows in the output tensor that hold box geometry
const BOX_ROWS: usize = 4;

/// Box in original image coordinates (top-left corner plus size)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union; zero when the boxes do not overlap
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// One detected card region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: CardClass,
    /// Confidence score (0.0-1.0)
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Which kind of input a detection ran on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectMode {
    /// Live video frame
    Frame,
    /// Captured or uploaded still image
    Image,
}

/// Thresholds applied during decoding and suppression
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionThresholds {
    pub frame_confidence: f32,
    pub image_confidence: f32,
    pub iou: f32,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            frame_confidence: DEFAULT_FRAME_CONFIDENCE,
            image_confidence: DEFAULT_IMAGE_CONFIDENCE,
            iou: DEFAULT_IOU_THRESHOLD,
        }
    }
}

impl DetectionThresholds {
    /// Confidence threshold for the given input kind
    pub fn confidence_for(&self, mode: DetectMode) -> f32 {
        match mode {
            DetectMode::Frame => self.frame_confidence,
            DetectMode::Image => self.image_confidence,
        }
    }
}

/// Decode a raw detector output into detections
///
/// `output` is the flattened `[1, 4 + labels.len(), candidates]` tensor. Rows
/// 0-3 are center x, center y, width and height in model-input pixels; the
/// remaining rows are per-class scores. A candidate is kept when its best class
/// score is strictly above `confidence_threshold`.
pub fn decode(
    output: &[f32],
    dims: &[usize],
    labels: &[CardClass],
    confidence_threshold: f32,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, DetectorError> {
    if labels.is_empty() {
        return Err(DetectorError::InvalidOutput(
            "no class labels configured".to_string(),
        ));
    }
    if dims.len() != 3 || dims[0] != 1 || dims[1] != BOX_ROWS + labels.len() {
        return Err(DetectorError::InvalidOutput(format!(
            "output shape {:?} does not match [1, {}, N]",
            dims,
            BOX_ROWS + labels.len()
        )));
    }
    let candidates = dims[2];
    let expected_len = dims[1] * candidates;
    if output.len() != expected_len {
        return Err(DetectorError::InvalidOutput(format!(
            "output has {} values, shape {:?} needs {}",
            output.len(),
            dims,
            expected_len
        )));
    }

    let row = |r: usize, i: usize| output[r * candidates + i];
    let mut detections = Vec::new();

    for i in 0..candidates {
        let mut best_class = 0usize;
        let mut best_score = f32::MIN;
        for c in 0..labels.len() {
            let score = row(BOX_ROWS + c, i);
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }

        if best_score <= confidence_threshold {
            continue;
        }

        detections.push(Detection {
            class: labels[best_class],
            confidence: best_score,
            bbox: letterbox.map_box(row(0, i), row(1, i), row(2, i), row(3, i)),
        });
    }

    if enabled!(Level::DEBUG) && !detections.is_empty() {
        let mut top: Vec<&Detection> = detections.iter().collect();
        top.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        for det in top.iter().take(5) {
            debug!("candidate {}: {:.4}", det.class, det.confidence);
        }
    }

    debug!(
        "Decoded {} of {} candidates above {:.2}",
        detections.len(),
        candidates,
        confidence_threshold
    );

    Ok(detections)
}

/// Greedy per-class non-maximum suppression
///
/// Detections of different classes never suppress each other: a front, a back
/// and a printed copy may all be present in one frame.
pub fn suppress(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut suppressed = vec![false; detections.len()];
    let mut kept = Vec::with_capacity(detections.len());

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j]
                && detections[j].class == detections[i].class
                && detections[i].bbox.iou(&detections[j].bbox) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
        kept.push(i);
    }

    kept.into_iter().map(|i| detections[i].clone()).collect()
}

/// Scene-level summary of one detect call
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub front_detected: bool,
    pub front_confidence: f32,
    pub back_detected: bool,
    pub back_confidence: f32,
    /// A printed/photocopied card fired; terminal fraud signal
    pub print_detected: bool,
    pub print_confidence: f32,
    /// Highest-confidence detection across all classes
    pub best_match: Option<Detection>,
    /// Every detection that survived suppression, highest confidence first
    pub detections: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DetectMode>,
    /// Why the call could not produce detections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResult {
    /// "Not detected" result carrying the failure reason
    pub fn failed(error: &DetectorError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: DetectMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Highest-confidence surviving detection of `class`
    pub fn best_of(&self, class: CardClass) -> Option<&Detection> {
        self.detections
            .iter()
            .filter(|d| d.class == class)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    /// Card side a caller may accept, if any
    ///
    /// `None` whenever a printed copy fired or the call failed, regardless of
    /// any front/back detections.
    pub fn accepted_side(&self) -> Option<CardClass> {
        if self.print_detected || self.is_failure() {
            return None;
        }
        self.best_match
            .as_ref()
            .map(|d| d.class)
            .filter(|c| matches!(c, CardClass::CardFront | CardClass::CardBack))
    }

    pub fn is_successful(&self) -> bool {
        self.accepted_side().is_some()
    }
}

/// Reduce surviving detections to per-class flags and the single best match
pub fn summarize(detections: Vec<Detection>) -> DetectionResult {
    let mut detections = detections;
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut result = DetectionResult {
        best_match: detections.first().cloned(),
        ..DetectionResult::default()
    };

    // Sorted descending, so the first hit per class is that class's best
    for det in &detections {
        match det.class {
            CardClass::CardFront if !result.front_detected => {
                result.front_detected = true;
                result.front_confidence = det.confidence;
            }
            CardClass::CardBack if !result.back_detected => {
                result.back_detected = true;
                result.back_confidence = det.confidence;
            }
            CardClass::PrintedCopy if !result.print_detected => {
                result.print_detected = true;
                result.print_confidence = det.confidence;
            }
            _ => {}
        }
    }

    result.detections = detections;
    result
}
