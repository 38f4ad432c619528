use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use assetfs_cas::{CancelToken, ImportSource, LocalCas};
use assetfs_config::Config;
use assetfs_fuse::watcher::load_tree;
use assetfs_fuse::{AssetFs, FsOptions, ManifestWatcher, NoopInvalidator};
use assetfs_integrity::Integrity;
use assetfs_manifest::View;

/// Mount the manifest as a read-only filesystem
#[derive(Args, Debug)]
pub struct MountArgs {
    /// Mount point directory
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,
}

pub fn run(args: MountArgs, config: Config) -> Result<()> {
    let services = crate::services::build(&config)?;

    if !args.mountpoint.exists() {
        std::fs::create_dir_all(&args.mountpoint).with_context(|| {
            format!("creating mountpoint {}", args.mountpoint.display())
        })?;
    }
    crate::preflight::ensure_not_mounted(&args.mountpoint)?;

    let view = View::from_name(&config.view).unwrap_or(View::Default);
    let (tree, manifest_digest, mtime) = load_tree(
        &config.manifest,
        view,
        config.digest_function(),
        &services.checksum_cache,
    )
    .with_context(|| format!("loading manifest {}", config.manifest.display()))?;

    // Views may fabricate files (e.g. BUILD.bazel); their bytes are
    // known now, so seed the local CAS and the cache up front.
    let cancel = CancelToken::new();
    for (name, content) in view.fake_leaves() {
        let digest = config.digest_function().digest_of_bytes(content);
        let integrity =
            Integrity::from_checksums([digest.checksum(config.digest_function())]);
        services
            .local_cas
            .import_blob(
                &cancel,
                &integrity,
                Some(digest),
                config.digest_function(),
                ImportSource::Reader(Box::new(std::io::Cursor::new(content.to_vec()))),
            )
            .with_context(|| format!("seeding synthetic file {name}"))?;
        services.checksum_cache.put_integrity(&integrity, digest);
    }

    let fs = AssetFs::new(
        services.prefetcher,
        &tree,
        mtime,
        FsOptions {
            digest_xattr_name: config.unix_digest_hash_attribute_name.clone(),
            xattr_encoding: config.xattr_encoding(),
            fail_reads: config.fail_reads,
        },
    );

    let mut watcher = ManifestWatcher::new(
        config.manifest.clone(),
        view,
        config.digest_function(),
        services.checksum_cache.clone(),
        fs.clone(),
        Box::new(NoopInvalidator),
        manifest_digest,
    );
    watcher.watch().context("watching manifest")?;
    std::thread::spawn(move || watcher.run());

    info!(
        manifest = %config.manifest.display(),
        cache = %config.disk_cache_path().display(),
        mountpoint = %args.mountpoint.display(),
        "mounting read-only asset filesystem"
    );

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        assetfs_fuse::fuse::mount(fs, &args.mountpoint).context("mounting filesystem")?;
        Ok(())
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        let _ = fs;
        anyhow::bail!("FUSE mounts are only supported on Linux builds with the `fuse` feature")
    }
}
