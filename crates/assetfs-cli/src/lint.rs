use anyhow::{Context, Result};
use clap::Args;

use assetfs_config::Config;
use assetfs_manifest::{Manifest, ManifestTree};

/// Validate the manifest without mounting anything
#[derive(Args, Debug)]
pub struct LintArgs {}

pub fn run(_args: LintArgs, config: Config) -> Result<()> {
    let raw = std::fs::read(&config.manifest)
        .with_context(|| format!("reading manifest {}", config.manifest.display()))?;

    let mut manifest = Manifest::parse(&raw)?;
    manifest.expand_templates();
    manifest.validate()?;
    let tree = ManifestTree::from_manifest(&manifest)?;

    println!(
        "{}: OK ({} entries)",
        config.manifest.display(),
        tree.leaves.len()
    );
    Ok(())
}
