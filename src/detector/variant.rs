// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model variants and class metadata
//!
//! The input resolution and class index order are properties of how each
//! artifact was exported; they are configured here and never inferred from the
//! graph.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classes emitted by the card detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardClass {
    CardBack,
    CardFront,
    PrintedCopy,
}

impl CardClass {
    pub fn label(&self) -> &'static str {
        match self {
            CardClass::CardBack => "card-back",
            CardClass::CardFront => "card-front",
            CardClass::PrintedCopy => "printed-copy",
        }
    }
}

impl fmt::Display for CardClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Class order shared by every exported artifact: 0 = back, 1 = front, 2 = print
pub const CARD_CLASS_ORDER: [CardClass; 3] = [
    CardClass::CardBack,
    CardClass::CardFront,
    CardClass::PrintedCopy,
];

/// Input resolution of the large variants
pub const LARGE_INPUT_SIZE: u32 = 640;

/// Input resolution of the small variants
pub const SMALL_INPUT_SIZE: u32 = 320;

/// Which exported detector to load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVariant {
    /// Full precision, 640x640 input
    #[default]
    #[serde(rename = "full-640")]
    FullLarge,
    /// Full precision, 320x320 input
    #[serde(rename = "full-320")]
    FullSmall,
    /// INT8 quantized, 640x640 input
    #[serde(rename = "int8-640")]
    QuantizedLarge,
    /// INT8 quantized, 320x320 input
    #[serde(rename = "int8-320")]
    QuantizedSmall,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 4] = [
        ModelVariant::FullLarge,
        ModelVariant::FullSmall,
        ModelVariant::QuantizedLarge,
        ModelVariant::QuantizedSmall,
    ];

    /// Square input resolution the artifact was exported with
    pub fn input_size(&self) -> u32 {
        match self {
            ModelVariant::FullLarge | ModelVariant::QuantizedLarge => LARGE_INPUT_SIZE,
            ModelVariant::FullSmall | ModelVariant::QuantizedSmall => SMALL_INPUT_SIZE,
        }
    }

    /// Artifact file name relative to the model source
    pub fn file_name(&self) -> &'static str {
        match self {
            ModelVariant::FullLarge => "card_detector.onnx",
            ModelVariant::FullSmall => "card_detector_small.onnx",
            ModelVariant::QuantizedLarge => "card_detector_int8.onnx",
            ModelVariant::QuantizedSmall => "card_detector_small_int8.onnx",
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(
            self,
            ModelVariant::QuantizedLarge | ModelVariant::QuantizedSmall
        )
    }

    /// Class index order of the artifact's score rows
    pub fn class_order(&self) -> &'static [CardClass] {
        &CARD_CLASS_ORDER
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::FullLarge => "full-640",
            ModelVariant::FullSmall => "full-320",
            ModelVariant::QuantizedLarge => "int8-640",
            ModelVariant::QuantizedSmall => "int8-320",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full-640" | "full" | "large" => Ok(ModelVariant::FullLarge),
            "full-320" | "small" => Ok(ModelVariant::FullSmall),
            "int8-640" | "int8" | "quantized" => Ok(ModelVariant::QuantizedLarge),
            "int8-320" | "int8-small" | "quantized-small" => Ok(ModelVariant::QuantizedSmall),
            other => Err(format!(
                "unknown model variant '{}'; expected one of: full-640, full-320, int8-640, int8-320",
                other
            )),
        }
    }
}
