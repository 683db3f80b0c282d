// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the ID card detector

/// Semantic version number
pub const VERSION_NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Build date
pub const BUILD_DATE: &str = "2026-10-19";

/// Supported features in this version
pub const FEATURES: &[&str] = &[
    "onnx-runtime-cpu",
    "letterbox-preprocessing",
    "per-class-nms",
    "print-copy-detection",
    "single-flight-model-load",
    "serialized-detect-queue",
    "detect-timeout",
    "quantized-variants",
];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!("ID Card Detector {} ({})", VERSION_NUMBER, BUILD_DATE)
}

/// Get full version info as JSON
pub fn get_version_info() -> serde_json::Value {
    serde_json::json!({
        "name": get_version_string(),
        "version": VERSION_NUMBER,
        "date": BUILD_DATE,
        "features": FEATURES,
        "variants": crate::detector::ModelVariant::ALL
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>(),
    })
}
