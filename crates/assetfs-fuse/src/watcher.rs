//! Manifest file watcher.
//!
//! Watches the manifest's directory for changes and swaps the
//! filesystem tree when the file's digest actually changed. Reloads are
//! conservative: a syntactically broken manifest (e.g. caught mid-write)
//! is skipped with a warning and the previous tree stays live.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::SystemTime;

use assetfs_integrity::{Algorithm, ChecksumCache, Digest};
use assetfs_manifest::{Manifest, ManifestError, ManifestTree, View};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::fs::{AssetFs, ROOT_INO};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// Kernel dentry invalidation hook. A FUSE session with notification
/// support plugs in here; with the no-op the short entry TTLs still
/// make the kernel converge within a second of a reload.
pub trait Invalidator: Send {
    fn invalidate_entry(&self, parent_ino: u64, name: &str);
}

pub struct NoopInvalidator;

impl Invalidator for NoopInvalidator {
    fn invalidate_entry(&self, _parent_ino: u64, _name: &str) {}
}

/// Loads the manifest, renders it through the view and primes the
/// checksum cache with every `(integrity, size)` pair the manifest
/// already knows, so attribute requests need no resolution.
pub fn load_tree(
    path: &Path,
    view: View,
    digest_function: Algorithm,
    cache: &ChecksumCache,
) -> Result<(ManifestTree, Digest, SystemTime), WatchError> {
    let raw = std::fs::read(path)?;
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now());
    let manifest_digest = digest_function.digest_of_bytes(&raw);
    let tree = build_tree(&raw, view, digest_function)?;
    prime_cache(&tree, digest_function, cache);
    Ok((tree, manifest_digest, mtime))
}

fn build_tree(
    raw: &[u8],
    view: View,
    digest_function: Algorithm,
) -> Result<ManifestTree, ManifestError> {
    let mut manifest = Manifest::parse(raw)?;
    manifest.expand_templates();
    manifest.validate()?;
    view.tree(&manifest, digest_function)
}

fn prime_cache(tree: &ManifestTree, digest_function: Algorithm, cache: &ChecksumCache) {
    for leaf in tree.leaves.values() {
        if leaf.size_hint < 0 {
            continue;
        }
        if let Some(checksum) = leaf.integrity.checksum_for(digest_function) {
            if let Ok(digest) = Digest::new(&checksum.hash, leaf.size_hint, digest_function) {
                cache.put_integrity(&leaf.integrity, digest);
            }
        }
    }
}

pub struct ManifestWatcher {
    manifest_path: PathBuf,
    view: View,
    digest_function: Algorithm,
    cache: Arc<ChecksumCache>,
    fs: Arc<AssetFs>,
    invalidator: Box<dyn Invalidator>,
    manifest_digest: Digest,
    notify_watcher: Option<RecommendedWatcher>,
    events: Option<Receiver<notify::Result<Event>>>,
}

impl ManifestWatcher {
    /// `manifest_digest` is the digest of the manifest the filesystem
    /// was built from, as returned by [`load_tree`].
    pub fn new(
        manifest_path: PathBuf,
        view: View,
        digest_function: Algorithm,
        cache: Arc<ChecksumCache>,
        fs: Arc<AssetFs>,
        invalidator: Box<dyn Invalidator>,
        manifest_digest: Digest,
    ) -> ManifestWatcher {
        ManifestWatcher {
            manifest_path,
            view,
            digest_function,
            cache,
            fs,
            invalidator,
            manifest_digest,
            notify_watcher: None,
            events: None,
        }
    }

    /// Registers the OS watch. Watches the parent directory, not the
    /// file: editors and atomic writers replace the file inode.
    pub fn watch(&mut self) -> Result<(), WatchError> {
        let manifest_abs = self
            .manifest_path
            .canonicalize()
            .unwrap_or_else(|_| self.manifest_path.clone());
        let dir = manifest_abs
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = tx.send(event);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(
            manifest = %manifest_abs.display(),
            digest = %self.manifest_digest.hex(self.digest_function),
            "watching manifest"
        );
        self.manifest_path = manifest_abs;
        self.notify_watcher = Some(watcher);
        self.events = Some(rx);
        Ok(())
    }

    /// Blocks servicing watch events until the event channel closes.
    pub fn run(mut self) {
        let Some(events) = self.events.take() else {
            error!("manifest watcher started without watch()");
            return;
        };
        for event in events.iter() {
            match event {
                Ok(event) => {
                    if !self.is_relevant(&event) {
                        continue;
                    }
                    debug!("manifest file might have changed");
                    if let Err(e) = self.reload_if_changed() {
                        error!(error = %e, "manifest reload failed");
                    }
                }
                Err(e) => warn!(error = %e, "manifest watcher error"),
            }
        }
        info!("manifest watcher stopped");
    }

    fn is_relevant(&self, event: &Event) -> bool {
        let kind_matches = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        );
        kind_matches && event.paths.iter().any(|p| p == &self.manifest_path)
    }

    /// Re-reads the manifest; swaps the tree only when the content
    /// digest changed and the new manifest builds. Returns whether a
    /// swap happened.
    pub fn reload_if_changed(&mut self) -> Result<bool, WatchError> {
        let raw = std::fs::read(&self.manifest_path)?;
        let new_digest = self.digest_function.digest_of_bytes(&raw);
        if new_digest.equals(&self.manifest_digest, self.digest_function) {
            debug!("manifest digest unchanged, skipping reload");
            return Ok(false);
        }

        let tree = match build_tree(&raw, self.view, self.digest_function) {
            Ok(tree) => tree,
            Err(e) if e.is_decode() => {
                warn!(error = %e, "syntax error in manifest - skipping reload");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = std::fs::metadata(&self.manifest_path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        info!(
            digest = %new_digest.hex(self.digest_function),
            "manifest changed, updating tree"
        );
        prime_cache(&tree, self.digest_function, &self.cache);
        let (old_names, new_names) = self.fs.install_tree(&tree, mtime);
        self.manifest_digest = new_digest;

        // Tell the kernel every root entry that appeared, vanished or
        // was replaced.
        let mut names = old_names;
        for name in new_names {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        for name in &names {
            self.invalidator.invalidate_entry(ROOT_INO, name);
        }
        Ok(true)
    }
}
