//! # assetfs-fuse
//!
//! The kernel-facing side of assetfs: a read-only FUSE filesystem whose
//! tree comes from the manifest and whose bytes come from the
//! prefetcher.
//!
//! The filesystem semantics live in [`fs`] and are independent of the
//! FUSE transport, so they can be exercised directly in tests; the thin
//! `fuser` binding is in [`fuse`] (feature `fuse`, Linux only). The
//! manifest watcher in [`watcher`] swaps the tree at runtime.

pub mod fs;
pub mod watcher;

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub mod fuse;

pub use fs::{AssetFs, FsOptions, NodeAttr, NodeKind, EPOCH_FILE_NAME};
pub use watcher::{Invalidator, ManifestWatcher, NoopInvalidator};
