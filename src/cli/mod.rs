// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod detect;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// ID card detector CLI
#[derive(Parser, Debug)]
#[command(name = "idcard-cli")]
#[command(version)]
#[command(about = "Run the on-device ID card detector against images", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Detect a card in an image file or URL
    Detect(detect::DetectArgs),

    /// Fetch and compile a model variant
    Warmup(detect::WarmupArgs),

    /// Print version and supported variants
    Info,
}

/// Execute CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Detect(args) => detect::run_detect(args).await,
        Commands::Warmup(args) => detect::run_warmup(args).await,
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(&crate::version::get_version_info())?);
            Ok(())
        }
    }
}
