//! Builds the data-plane service stack from the configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use assetfs_cas::{Cas, DiskCas, LocalCas};
use assetfs_config::Config;
use assetfs_fetch::Downloader;
use assetfs_integrity::ChecksumCache;
use assetfs_prefetch::Prefetcher;
use assetfs_remote::AssetFetcher;

pub struct Services {
    pub local_cas: Arc<DiskCas>,
    pub checksum_cache: Arc<ChecksumCache>,
    pub prefetcher: Arc<Prefetcher>,
}

/// Wires local CAS, checksum cache, remote clients and downloader into
/// a prefetcher.
///
/// The remote CAS and remote asset clients are generic over an RPC
/// transport this binary does not ship; until one is plugged in, a
/// configured `remote` endpoint only earns a warning and the remote
/// tiers stay disabled. The local tiers and the direct downloader are
/// fully functional.
pub fn build(config: &Config) -> Result<Services> {
    let cache_root = config.disk_cache_path();
    let local_cas = Arc::new(
        DiskCas::new(&cache_root)
            .with_context(|| format!("opening disk cache {}", cache_root.display()))?,
    );
    let checksum_cache = Arc::new(ChecksumCache::new());

    let (remote_cas, remote_asset): (Option<Arc<dyn Cas>>, Option<Arc<dyn AssetFetcher>>) =
        if config.remote.is_empty() {
            (None, None)
        } else {
            warn!(
                remote = %config.remote,
                "no RPC transport is linked into this build; remote CAS and \
                 remote asset tiers are disabled"
            );
            (None, None)
        };

    let downloader: Arc<dyn AssetFetcher> =
        Arc::new(Downloader::new(Arc::clone(&local_cas) as Arc<dyn LocalCas>));

    let prefetcher = Arc::new(Prefetcher::new(
        Arc::clone(&local_cas) as Arc<dyn LocalCas>,
        remote_cas,
        remote_asset,
        Some(downloader),
        Arc::clone(&checksum_cache),
        config.digest_function(),
    ));

    Ok(Services {
        local_cas,
        checksum_cache,
        prefetcher,
    })
}
