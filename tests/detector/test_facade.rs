// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Detection facade tests
//!
//! Runs the full preprocess, inference, decode, suppress and summarize path
//! against stub sessions returning synthetic output tensors.

use super::support::{manager_with, output_tensor, CountingFetcher, StubBackend};
use futures::future::join_all;
use idcard_detector::config::DetectorConfig;
use idcard_detector::detector::{
    CardClass, CardDetector, DetectMode, DetectionThresholds, ModelState,
};
use idcard_detector::vision::{ImageSource, VideoFrame};
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use std::time::Duration;

fn still_image() -> ImageSource {
    ImageSource::Pixels(RgbaImage::from_pixel(640, 640, Rgba([200, 200, 200, 255])))
}

fn detector_for(backend: StubBackend) -> (CardDetector, Arc<CountingFetcher>, Arc<StubBackend>) {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(backend);
    let manager = manager_with(fetcher.clone(), backend.clone());
    let detector = CardDetector::new(manager, &DetectorConfig::default());
    (detector, fetcher, backend)
}

/// Back at 0.9 and front at 0.2 on a still image: only the back is reported
#[tokio::test]
async fn test_back_detected_front_below_threshold() {
    let (detector, _, _) = detector_for(StubBackend::new(output_tensor(&[
        (320.0, 320.0, 300.0, 200.0, [0.9, 0.05, 0.0]),
        (100.0, 100.0, 80.0, 50.0, [0.0, 0.2, 0.0]),
    ])));

    let result = detector.detect_image(still_image()).await;

    assert!(result.error.is_none(), "unexpected failure: {:?}", result.error);
    assert!(result.back_detected);
    assert!((result.back_confidence - 0.9).abs() < 1e-6);
    assert!(!result.front_detected);
    assert!(!result.print_detected);
    assert_eq!(result.mode, Some(DetectMode::Image));
    assert_eq!(result.accepted_side(), Some(CardClass::CardBack));
}

/// A printed copy alongside a strong front makes the capture unacceptable
#[tokio::test]
async fn test_print_detection_is_terminal() {
    let (detector, _, _) = detector_for(StubBackend::new(output_tensor(&[
        (320.0, 320.0, 300.0, 200.0, [0.0, 0.8, 0.1]),
        (320.0, 320.0, 300.0, 190.0, [0.0, 0.1, 0.5]),
    ])));

    let result = detector.detect_image(still_image()).await;

    assert!(result.print_detected);
    assert!((result.print_confidence - 0.5).abs() < 1e-6);
    assert!(result.front_detected);
    assert_eq!(
        result.best_match.as_ref().map(|d| d.class),
        Some(CardClass::CardFront)
    );
    assert_eq!(result.accepted_side(), None);
    assert!(!result.is_successful());
}

/// Frames use the lower threshold, so a 0.2 front counts on video only
#[tokio::test]
async fn test_frame_and_image_thresholds_differ() {
    let (detector, _, _) = detector_for(StubBackend::new(output_tensor(&[(
        320.0,
        320.0,
        300.0,
        200.0,
        [0.0, 0.2, 0.0],
    )])));

    let frame = VideoFrame::from_image(
        RgbaImage::from_pixel(640, 640, Rgba([0, 0, 0, 255])),
        Duration::from_millis(40),
    );
    let on_frame = detector.detect_frame(frame).await;
    let on_image = detector.detect_image(still_image()).await;

    assert!(on_frame.front_detected);
    assert_eq!(on_frame.mode, Some(DetectMode::Frame));
    assert!(!on_image.front_detected);

    let strict = detector.with_thresholds(DetectionThresholds {
        frame_confidence: 0.5,
        ..DetectionThresholds::default()
    });
    let frame = VideoFrame::from_image(RgbaImage::new(640, 640), Duration::ZERO);
    assert!(!strict.detect_frame(frame).await.front_detected);
}

/// Overlapping boxes of one class collapse to the strongest
#[tokio::test]
async fn test_overlapping_detections_are_suppressed() {
    let (detector, _, _) = detector_for(StubBackend::new(output_tensor(&[
        (320.0, 320.0, 300.0, 200.0, [0.0, 0.9, 0.0]),
        (322.0, 321.0, 300.0, 200.0, [0.0, 0.7, 0.0]),
        (320.0, 320.0, 300.0, 200.0, [0.6, 0.0, 0.0]),
    ])));

    let result = detector.detect_image(still_image()).await;

    assert_eq!(result.detections.len(), 2);
    assert_eq!(result.detections[0].class, CardClass::CardFront);
    assert!((result.front_confidence - 0.9).abs() < 1e-6);
    assert!(result.back_detected);
}

/// Boxes are reported in original frame coordinates
#[tokio::test]
async fn test_frame_boxes_map_back_to_original_coordinates() {
    let (detector, _, _) = detector_for(StubBackend::new(output_tensor(&[(
        320.0,
        320.0,
        100.0,
        50.0,
        [0.7, 0.0, 0.0],
    )])));

    let frame = VideoFrame::new(1280, 720, vec![128; 1280 * 720 * 4], Duration::ZERO).unwrap();
    let result = detector.detect_frame(frame).await;

    let best = result.best_match.expect("expected a detection");
    assert!((best.bbox.x - 540.0).abs() < 1e-3);
    assert!((best.bbox.y - 310.0).abs() < 1e-3);
    assert!((best.bbox.width - 200.0).abs() < 1e-3);
    assert!((best.bbox.height - 100.0).abs() < 1e-3);
}

/// A model that cannot load yields a "not detected" result, not an error
#[tokio::test]
async fn test_unavailable_model_degrades_to_not_detected() {
    let fetcher = Arc::new(CountingFetcher::failing(usize::MAX));
    let backend = Arc::new(StubBackend::new(output_tensor(&[])));
    let manager = manager_with(fetcher, backend);
    let detector = CardDetector::new(manager.clone(), &DetectorConfig::default());

    let result = detector.detect_image(still_image()).await;

    let reason = result.error.as_deref().expect("expected a failure reason");
    assert!(reason.contains("not ready"), "reason was {}", reason);
    assert!(!result.front_detected && !result.back_detected && !result.print_detected);
    assert!(result.best_match.is_none());
    assert_eq!(manager.state(), ModelState::Error);
}

/// A bad input fails that call only; the model stays loaded
#[tokio::test]
async fn test_bad_source_does_not_reload_model() {
    let (detector, fetcher, backend) = detector_for(StubBackend::new(output_tensor(&[(
        320.0,
        320.0,
        300.0,
        200.0,
        [0.0, 0.9, 0.0],
    )])));
    detector.warmup().await.unwrap();

    let result = detector
        .detect_image(ImageSource::File(b"definitely not an image".to_vec()))
        .await;
    assert!(result.error.is_some());

    let result = detector.detect_image(still_image()).await;
    assert!(result.front_detected);
    assert_eq!(detector.manager().state(), ModelState::Ready);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(backend.compiles(), 1);
}

/// Concurrent detects never run on the session at the same time
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_detects_are_serialized() {
    let (detector, _, backend) = detector_for(
        StubBackend::new(output_tensor(&[(320.0, 320.0, 300.0, 200.0, [0.9, 0.0, 0.0])]))
            .with_delay(Duration::from_millis(30)),
    );

    let results = join_all((0..4).map(|_| detector.detect_image(still_image()))).await;

    assert!(results.iter().all(|r| r.back_detected));
    assert_eq!(backend.concurrency.max(), 1);
    assert_eq!(backend.compiles(), 1);
}

/// A slow detect times out for its caller without blocking later detects
#[tokio::test]
async fn test_detect_timeout_reports_failure() {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(
        StubBackend::new(output_tensor(&[(320.0, 320.0, 300.0, 200.0, [0.9, 0.0, 0.0])]))
            .with_delay(Duration::from_millis(200)),
    );
    let manager = manager_with(fetcher, backend);
    manager.ensure_ready().await.unwrap();

    let impatient = CardDetector::new(manager.clone(), &DetectorConfig::default())
        .with_detect_timeout(Duration::from_millis(20));
    let result = impatient.detect_image(still_image()).await;
    let reason = result.error.as_deref().expect("expected a timeout");
    assert!(reason.contains("timed out"), "reason was {}", reason);

    let patient = CardDetector::new(manager.clone(), &DetectorConfig::default());
    let result = patient.detect_image(still_image()).await;
    assert!(result.back_detected);
    assert_eq!(manager.ref_count(), 2);
}
