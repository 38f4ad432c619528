use anyhow::{Context, Result};
use clap::Args;
use tracing::{error, info};

use assetfs_cas::CancelToken;
use assetfs_config::Config;
use assetfs_fuse::watcher::load_tree;

/// Materialize manifest entries into the local CAS
#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Paths to fetch; every entry when omitted
    #[arg(value_name = "PATH")]
    paths: Vec<String>,
}

pub fn run(args: FetchArgs, config: Config) -> Result<()> {
    let services = crate::services::build(&config)?;
    let view = assetfs_manifest::View::from_name(&config.view)
        .unwrap_or(assetfs_manifest::View::Default);
    let (tree, _digest, _mtime) = load_tree(
        &config.manifest,
        view,
        config.digest_function(),
        &services.checksum_cache,
    )
    .with_context(|| format!("loading manifest {}", config.manifest.display()))?;

    let cancel = CancelToken::new();
    let mut fetched = 0usize;
    let mut failed = 0usize;
    for (path, leaf) in &tree.leaves {
        if !args.paths.is_empty() && !args.paths.iter().any(|p| p == path) {
            continue;
        }
        match services.prefetcher.materialize(&cancel, &leaf.to_asset()) {
            Ok(()) => {
                info!(path, "materialized");
                fetched += 1;
            }
            Err(e) => {
                error!(path, error = %e, "failed to materialize");
                failed += 1;
            }
        }
    }

    if !args.paths.is_empty() {
        for requested in &args.paths {
            if !tree.leaves.contains_key(requested) {
                anyhow::bail!("no manifest entry named {requested:?}");
            }
        }
    }
    println!("fetched {fetched} entries into {}", config.disk_cache_path().display());
    if failed > 0 {
        anyhow::bail!("{failed} entries failed");
    }
    Ok(())
}
