//! # assetfs CLI
//!
//! Command-line interface for the manifest-declared remote-asset
//! filesystem.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use assetfs_config::Config;

mod fetch;
mod lint;
mod mount;
mod preflight;
mod services;

/// Serve remote assets, declared by a manifest, as a read-only
/// filesystem backed by content-addressed storage.
#[derive(Parser)]
#[command(name = "assetfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON). Falls back to $ASSETFS_CONFIG_FILE.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Mount(mount::MountArgs),
    Lint(lint::LintArgs),
    Fetch(fetch::FetchArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::resolve_path(cli.config) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    config.validate()?;
    assetfs_config::logging::init(&config.log_level);

    match cli.command {
        Commands::Mount(args) => mount::run(args, config),
        Commands::Lint(args) => lint::run(args, config),
        Commands::Fetch(args) => fetch::run(args, config),
    }
}
