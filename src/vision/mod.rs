// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image inputs for the card detector
//!
//! Decodes uploads, paths, data URLs and remote URLs into RGBA pixels, and
//! wraps raw camera frames.

pub mod image_utils;
pub mod source;

pub use image_utils::{decode_base64_image, decode_image_bytes, detect_format, ImageError};
pub use source::{ImageSource, VideoFrame};
