// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Letterbox preprocessing and box mapping for the card detector
//!
//! Steps:
//! 1. Scale the source uniformly to fit inside the square model input
//! 2. Center it on a canvas filled with the training pad color (114)
//! 3. Read back RGBA pixels and write them as planar RGB in [0, 1]
//!    (NCHW tensor `[1, 3, S, S]`, alpha dropped)
//!
//! The scale and padding are recorded in a [`Letterbox`] so boxes predicted in
//! model space can be mapped back onto the original image.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use ndarray::{Array4, ArrayView4};

use super::error::DetectorError;
use super::postprocess::BoundingBox;

/// Pad color the detector was trained with; it reads as "no content"
pub const PAD_VALUE: u8 = 114;

const PAD_PIXEL: Rgba<u8> = Rgba([PAD_VALUE, PAD_VALUE, PAD_VALUE, 255]);

/// Scale and padding applied when an image was letterboxed into the model input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Uniform scale factor applied to the source
    pub scale: f32,
    /// Horizontal padding (left edge) in model pixels
    pub pad_x: u32,
    /// Vertical padding (top edge) in model pixels
    pub pad_y: u32,
    /// Original image width
    pub original_width: u32,
    /// Original image height
    pub original_height: u32,
    /// Side of the square model input
    pub target_size: u32,
}

impl Letterbox {
    /// Calculate scale-to-fit and centering offsets for an image
    pub fn compute(width: u32, height: u32, target_size: u32) -> Result<Self, DetectorError> {
        if target_size == 0 {
            return Err(DetectorError::RenderingUnavailable(
                "target size must be greater than 0".to_string(),
            ));
        }
        if width == 0 || height == 0 {
            return Err(DetectorError::SourceLoadFailed(format!(
                "source has no pixels ({}x{})",
                width, height
            )));
        }

        let target = target_size as f32;
        let scale = (target / width as f32).min(target / height as f32);
        let (new_w, new_h) = scaled_dimensions(width, height, scale, target_size);

        Ok(Self {
            scale,
            pad_x: (target_size - new_w) / 2,
            pad_y: (target_size - new_h) / 2,
            original_width: width,
            original_height: height,
            target_size,
        })
    }

    /// Size of the scaled image inside the square
    pub fn scaled_dimensions(&self) -> (u32, u32) {
        scaled_dimensions(
            self.original_width,
            self.original_height,
            self.scale,
            self.target_size,
        )
    }

    /// Map a model-space box (center x/y, width, height) onto the original image
    pub fn map_box(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        postprocess_box(
            cx,
            cy,
            w,
            h,
            self.scale,
            self.pad_x,
            self.pad_y,
            self.original_width,
            self.original_height,
        )
    }
}

fn scaled_dimensions(width: u32, height: u32, scale: f32, target_size: u32) -> (u32, u32) {
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, target_size);
    (new_w, new_h)
}

/// Invert the letterbox transform for one box and clamp it to the image bounds
#[allow(clippy::too_many_arguments)]
pub fn postprocess_box(
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    original_width: u32,
    original_height: u32,
) -> BoundingBox {
    let x = ((cx - w / 2.0) - pad_x as f32) / scale;
    let y = ((cy - h / 2.0) - pad_y as f32) / scale;
    let width = w / scale;
    let height = h / scale;

    let x = x.max(0.0);
    let y = y.max(0.0);

    BoundingBox {
        x,
        y,
        width: width.min(original_width as f32 - x).max(0.0),
        height: height.min(original_height as f32 - y).max(0.0),
    }
}

/// Reusable drawing surface and input tensor for one model resolution
///
/// Owned by the lifecycle manager next to the inference session so repeated
/// frames do not reallocate the canvas or the tensor.
#[derive(Debug, Clone)]
pub struct LetterboxCanvas {
    target_size: u32,
    canvas: RgbaImage,
    tensor: Array4<f32>,
}

impl LetterboxCanvas {
    pub fn new(target_size: u32) -> Result<Self, DetectorError> {
        if target_size == 0 {
            return Err(DetectorError::RenderingUnavailable(
                "canvas size must be greater than 0".to_string(),
            ));
        }
        let side = target_size as usize;
        Ok(Self {
            target_size,
            canvas: RgbaImage::from_pixel(target_size, target_size, PAD_PIXEL),
            tensor: Array4::zeros((1, 3, side, side)),
        })
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Reallocate for a different input resolution (no-op when unchanged)
    pub fn resize(&mut self, target_size: u32) -> Result<(), DetectorError> {
        if target_size != self.target_size {
            *self = Self::new(target_size)?;
        }
        Ok(())
    }

    /// Letterbox `image` into the canvas and refresh the planar tensor
    pub fn preprocess(&mut self, image: &RgbaImage) -> Result<Letterbox, DetectorError> {
        let letterbox = Letterbox::compute(image.width(), image.height(), self.target_size)?;
        let (new_w, new_h) = letterbox.scaled_dimensions();

        for pixel in self.canvas.pixels_mut() {
            *pixel = PAD_PIXEL;
        }

        let resized = if (new_w, new_h) == image.dimensions() {
            None
        } else {
            Some(imageops::resize(image, new_w, new_h, FilterType::Triangle))
        };
        let scaled = resized.as_ref().unwrap_or(image);
        // Alpha-over onto the gray fill so transparent regions read as padding
        imageops::overlay(
            &mut self.canvas,
            scaled,
            letterbox.pad_x as i64,
            letterbox.pad_y as i64,
        );

        let plane = (self.target_size as usize) * (self.target_size as usize);
        let tensor = self.tensor.as_slice_mut().ok_or_else(|| {
            DetectorError::RenderingUnavailable("input tensor is not contiguous".to_string())
        })?;
        for (i, px) in self.canvas.as_raw().chunks_exact(4).enumerate() {
            tensor[i] = px[0] as f32 / 255.0;
            tensor[plane + i] = px[1] as f32 / 255.0;
            tensor[2 * plane + i] = px[2] as f32 / 255.0;
        }

        Ok(letterbox)
    }

    /// Planar input tensor `[1, 3, S, S]` from the last `preprocess` call
    pub fn tensor(&self) -> ArrayView4<'_, f32> {
        self.tensor.view()
    }

    /// Letterboxed RGBA canvas from the last `preprocess` call
    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }
}

/// One-off preprocessing without a reusable canvas
pub fn preprocess(
    image: &RgbaImage,
    target_size: u32,
) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let mut canvas = LetterboxCanvas::new(target_size)?;
    let letterbox = canvas.preprocess(image)?;
    Ok((canvas.tensor, letterbox))
}
