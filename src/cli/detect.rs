// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::config::DetectorConfig;
use crate::detector::{CardDetector, DetectionResult, ModelLifecycleManager, ModelVariant};
use crate::vision::{ImageSource, VideoFrame};

/// Model selection shared by every command
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Model variant (full-640, full-320, int8-640, int8-320)
    #[arg(long)]
    pub variant: Option<ModelVariant>,

    /// Base URL or directory holding the model artifacts
    #[arg(long, env = "IDCARD_MODEL_SOURCE")]
    pub model_source: Option<String>,
}

impl ModelArgs {
    /// Environment configuration with command-line overrides applied
    fn config(&self) -> DetectorConfig {
        let mut config = DetectorConfig::from_env();
        if let Some(variant) = self.variant {
            config.variant = variant;
        }
        if let Some(source) = &self.model_source {
            config.model_source = source.clone();
        }
        config
    }
}

/// Arguments for the detect command
#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Image file to scan
    #[arg(long, required_unless_present = "url", conflicts_with = "url")]
    pub image: Option<String>,

    /// http(s) URL, data: URL or base64 image to scan
    #[arg(long)]
    pub url: Option<String>,

    /// Treat the image as a live video frame (lower confidence threshold)
    #[arg(long)]
    pub frame: bool,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the warmup command
#[derive(Args, Debug)]
pub struct WarmupArgs {
    #[command(flatten)]
    pub model: ModelArgs,
}

/// Run detection on one image and report the result
pub async fn run_detect(args: DetectArgs) -> Result<()> {
    let config = args.model.config();
    let manager = ModelLifecycleManager::from_config(&config)
        .with_context(|| format!("Invalid model source {}", config.model_source))?;
    let detector = CardDetector::new(manager, &config);

    let source = match (&args.image, &args.url) {
        (Some(path), _) => ImageSource::Path(PathBuf::from(path)),
        (None, Some(url)) => ImageSource::Url(url.clone()),
        (None, None) => return Err(anyhow!("either --image or --url is required")),
    };

    let result = if args.frame {
        let client = reqwest::Client::new();
        let image = source
            .load(&client, config.source_timeout)
            .await
            .context("Failed to load frame")?;
        detector
            .detect_frame(VideoFrame::from_image(image, Duration::ZERO))
            .await
    } else {
        detector.detect_image(source).await
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    match &result.error {
        Some(reason) => Err(anyhow!("detection failed: {}", reason)),
        None => Ok(()),
    }
}

fn print_summary(result: &DetectionResult) {
    println!("Front:        {} ({:.2})", result.front_detected, result.front_confidence);
    println!("Back:         {} ({:.2})", result.back_detected, result.back_confidence);
    println!("Printed copy: {} ({:.2})", result.print_detected, result.print_confidence);

    if let Some(best) = &result.best_match {
        println!(
            "Best match:   {} {:.2} at ({:.0}, {:.0}) {:.0}x{:.0}",
            best.class, best.confidence, best.bbox.x, best.bbox.y, best.bbox.width, best.bbox.height
        );
    }

    match result.accepted_side() {
        Some(side) => println!("✅ Accepted: {}", side),
        None if result.print_detected => println!("❌ Rejected: printed copy detected"),
        None => println!("⚠️ No card detected"),
    }
}

/// Fetch and compile a variant, reporting progress
pub async fn run_warmup(args: WarmupArgs) -> Result<()> {
    let config = args.model.config();
    let manager = ModelLifecycleManager::from_config(&config)
        .with_context(|| format!("Invalid model source {}", config.model_source))?;

    let _progress = manager.on_progress(|percent| info!("Loading model: {}%", percent));
    manager
        .load(config.variant)
        .await
        .with_context(|| format!("Failed to load {} detector", config.variant))?;

    info!("✅ {} ready", config.variant);
    Ok(())
}
