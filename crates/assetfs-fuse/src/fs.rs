//! Filesystem node semantics, independent of the FUSE transport.
//!
//! Inodes are assigned from the manifest tree: ino 1 is the root, ino 2
//! the hidden epoch file, everything else is numbered depth-first in
//! directory order. A manifest reload rebuilds the whole table and swaps
//! it in atomically; open handles keep working because they own their
//! readers outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use assetfs_cas::{CancelToken, Error, RandomAccessReader};
use assetfs_config::XattrEncoding;
use assetfs_integrity::{Algorithm, Checksum};
use assetfs_manifest::{Directory, Leaf, ManifestTree, Node};
use assetfs_prefetch::Prefetcher;
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Hidden leaf whose content is the tree epoch in seconds. Not listed
/// by readdir, but resolvable by lookup, so external tools can watch it
/// to observe remounts and manifest reloads.
pub const EPOCH_FILE_NAME: &str = ".assetfs-epoch";

pub const ROOT_INO: u64 = 1;
pub const EPOCH_INO: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Transport-independent file attributes.
#[derive(Debug, Clone)]
pub struct NodeAttr {
    pub ino: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
    pub mtime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct FsOptions {
    /// Custom digest xattr name (Bazel's
    /// `--unix_digest_hash_attribute_name`); empty disables it.
    pub digest_xattr_name: String,
    pub xattr_encoding: XattrEncoding,
    /// Diagnostic mode: reads fail with EBADF so misbehaving consumers
    /// that should only ever look at digests are caught red-handed.
    pub fail_reads: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        FsOptions {
            digest_xattr_name: String::new(),
            xattr_encoding: XattrEncoding::Raw,
            fail_reads: false,
        }
    }
}

enum InodeEntry {
    Dir {
        /// Children sorted by name; readdir order.
        children: Vec<(String, u64)>,
        parent: u64,
    },
    Leaf {
        leaf: Arc<Leaf>,
        path: String,
    },
}

struct FsState {
    epoch: SystemTime,
    inodes: HashMap<u64, InodeEntry>,
}

impl FsState {
    fn build(tree: &ManifestTree, epoch: SystemTime) -> FsState {
        let mut inodes = HashMap::new();
        let mut next_ino = EPOCH_INO + 1;
        let root_children =
            Self::build_dir(&tree.root, ROOT_INO, String::new(), &mut inodes, &mut next_ino);
        inodes.insert(
            ROOT_INO,
            InodeEntry::Dir {
                children: root_children,
                parent: ROOT_INO,
            },
        );
        FsState { epoch, inodes }
    }

    fn build_dir(
        dir: &Directory,
        ino: u64,
        prefix: String,
        inodes: &mut HashMap<u64, InodeEntry>,
        next_ino: &mut u64,
    ) -> Vec<(String, u64)> {
        let mut children = Vec::with_capacity(dir.children.len());
        for (name, node) in &dir.children {
            let child_ino = *next_ino;
            *next_ino += 1;
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                Node::Directory(subdir) => {
                    let grandchildren =
                        Self::build_dir(subdir, child_ino, path, inodes, next_ino);
                    inodes.insert(
                        child_ino,
                        InodeEntry::Dir {
                            children: grandchildren,
                            parent: ino,
                        },
                    );
                }
                Node::Leaf(leaf) => {
                    inodes.insert(
                        child_ino,
                        InodeEntry::Leaf {
                            leaf: Arc::clone(leaf),
                            path,
                        },
                    );
                }
            }
            children.push((name.clone(), child_ino));
        }
        children
    }

    fn epoch_content(&self) -> String {
        let seconds = self
            .epoch
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{seconds}")
    }
}

struct OpenHandle {
    ino: u64,
    reader: Box<dyn RandomAccessReader>,
}

/// The filesystem core, shared between the FUSE binding and the
/// manifest watcher.
pub struct AssetFs {
    prefetcher: Arc<Prefetcher>,
    options: FsOptions,
    state: RwLock<FsState>,
    handles: RwLock<HashMap<u64, OpenHandle>>,
    next_handle: AtomicU64,
}

impl AssetFs {
    pub fn new(
        prefetcher: Arc<Prefetcher>,
        tree: &ManifestTree,
        epoch: SystemTime,
        options: FsOptions,
    ) -> Arc<AssetFs> {
        Arc::new(AssetFs {
            prefetcher,
            options,
            state: RwLock::new(FsState::build(tree, epoch)),
            handles: RwLock::new(HashMap::new()),
            // fh 0 is reserved for the epoch file.
            next_handle: AtomicU64::new(1),
        })
    }

    fn digest_function(&self) -> Algorithm {
        self.prefetcher.digest_function()
    }

    /// Installs a freshly built tree, returning the root entry names of
    /// the old and new trees so the caller can invalidate dentries.
    pub fn install_tree(
        &self,
        tree: &ManifestTree,
        epoch: SystemTime,
    ) -> (Vec<String>, Vec<String>) {
        let new_state = FsState::build(tree, epoch);
        let new_names = root_child_names(&new_state);
        let mut state = self.state.write();
        let old_names = root_child_names(&state);
        *state = new_state;
        (old_names, new_names)
    }

    pub fn epoch(&self) -> SystemTime {
        self.state.read().epoch
    }

    // ===== attribute and directory surface =====

    pub fn getattr(&self, ino: u64) -> Option<NodeAttr> {
        // Resolve under the lock, but never hold it while sizing a leaf:
        // that can go to the network.
        let (found_leaf, epoch) = {
            let state = self.state.read();
            let epoch = state.epoch;
            if ino == EPOCH_INO {
                return Some(NodeAttr {
                    ino,
                    kind: NodeKind::File,
                    size: state.epoch_content().len() as u64,
                    perm: 0o444,
                    mtime: epoch,
                });
            }
            match state.inodes.get(&ino)? {
                InodeEntry::Dir { .. } => (None, epoch),
                InodeEntry::Leaf { leaf, path } => {
                    (Some((Arc::clone(leaf), path.clone())), epoch)
                }
            }
        };
        Some(match found_leaf {
            None => NodeAttr {
                ino,
                kind: NodeKind::Directory,
                size: 0,
                perm: 0o555,
                mtime: epoch,
            },
            Some((leaf, path)) => self.leaf_attr(ino, &leaf, &path, epoch),
        })
    }

    fn leaf_attr(&self, ino: u64, leaf: &Leaf, path: &str, epoch: SystemTime) -> NodeAttr {
        let size = self.leaf_size(leaf, path);
        NodeAttr {
            ino,
            kind: NodeKind::File,
            size,
            perm: if leaf.executable { 0o555 } else { 0o444 },
            mtime: epoch,
        }
    }

    fn leaf_size(&self, leaf: &Leaf, path: &str) -> u64 {
        if leaf.size_hint >= 0 {
            return leaf.size_hint as u64;
        }
        if let Some(digest) = self
            .prefetcher
            .checksum_cache()
            .from_integrity(&leaf.integrity)
        {
            return digest.size_bytes.max(0) as u64;
        }
        match self
            .prefetcher
            .digest_of(&CancelToken::new(), &leaf.to_asset())
        {
            Ok(digest) => digest.size_bytes.max(0) as u64,
            Err(e) => {
                warn!(
                    path,
                    error = %e,
                    "reporting unknown size - consider adding the size to the manifest"
                );
                0
            }
        }
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Option<NodeAttr> {
        if parent == ROOT_INO && name == EPOCH_FILE_NAME {
            return self.getattr(EPOCH_INO);
        }
        let ino = {
            let state = self.state.read();
            match state.inodes.get(&parent)? {
                InodeEntry::Dir { children, .. } => children
                    .iter()
                    .find(|(child_name, _)| child_name == name)
                    .map(|(_, ino)| *ino)?,
                InodeEntry::Leaf { .. } => return None,
            }
        };
        self.getattr(ino)
    }

    /// Directory listing including `.` and `..`. The epoch file is
    /// deliberately absent.
    pub fn readdir(&self, ino: u64) -> Option<Vec<(u64, NodeKind, String)>> {
        let state = self.state.read();
        match state.inodes.get(&ino)? {
            InodeEntry::Dir { children, parent } => {
                let mut entries = Vec::with_capacity(children.len() + 2);
                entries.push((ino, NodeKind::Directory, ".".to_string()));
                entries.push((*parent, NodeKind::Directory, "..".to_string()));
                for (name, child_ino) in children {
                    let kind = match state.inodes.get(child_ino) {
                        Some(InodeEntry::Dir { .. }) => NodeKind::Directory,
                        _ => NodeKind::File,
                    };
                    entries.push((*child_ino, kind, name.clone()));
                }
                Some(entries)
            }
            InodeEntry::Leaf { .. } => None,
        }
    }

    // ===== extended attributes =====

    /// Resolves an xattr name to the checksum it exposes, or `ENODATA`.
    fn xattr_checksum(&self, leaf: &Leaf, name: &str) -> Result<Checksum, i32> {
        let algorithm = if !self.options.digest_xattr_name.is_empty()
            && name == self.options.digest_xattr_name
        {
            self.digest_function()
        } else if let Some(algorithm_name) = name.strip_prefix("user.") {
            match Algorithm::from_name(algorithm_name) {
                Some(algorithm) => algorithm,
                None => return Err(libc::ENODATA),
            }
        } else {
            return Err(libc::ENODATA);
        };

        if let Some(checksum) = leaf.integrity.checksum_for(algorithm) {
            return Ok(checksum);
        }
        if algorithm == self.digest_function() {
            // The manifest does not carry the primary checksum, but the
            // digest may be resolvable.
            if let Ok(digest) = self
                .prefetcher
                .digest_of(&CancelToken::new(), &leaf.to_asset())
            {
                return Ok(digest.checksum(algorithm));
            }
        }
        Err(libc::ENODATA)
    }

    /// Returns the xattr value for a leaf.
    ///
    /// Reading a digest xattr is how build tools satisfy action inputs
    /// without the bytes, so it doubles as a hint: the asset is
    /// prefetched into the remote CAS, best effort.
    pub fn getxattr(&self, ino: u64, name: &str) -> Result<Vec<u8>, i32> {
        let leaf = match self.leaf_of(ino) {
            Some(leaf) => leaf,
            None => return Err(libc::ENODATA),
        };
        let checksum = self.xattr_checksum(&leaf, name)?;

        self.prefetcher.enqueue_prefetch(leaf.to_asset());

        Ok(match self.options.xattr_encoding {
            XattrEncoding::Raw => checksum.hash,
            XattrEncoding::Hex => checksum.hex().into_bytes(),
        })
    }

    /// The xattr names a leaf exposes: `user.<algorithm>` for every
    /// declared checksum, plus the custom digest name if distinct.
    pub fn listxattr(&self, ino: u64) -> Vec<String> {
        let Some(leaf) = self.leaf_of(ino) else {
            return Vec::new();
        };
        let mut names: Vec<String> = leaf
            .integrity
            .items()
            .map(|c| format!("user.{}", c.algorithm.name()))
            .collect();
        let custom = &self.options.digest_xattr_name;
        if !custom.is_empty() && !names.iter().any(|n| n == custom) {
            names.push(custom.clone());
        }
        names
    }

    fn leaf_of(&self, ino: u64) -> Option<Arc<Leaf>> {
        let state = self.state.read();
        match state.inodes.get(&ino)? {
            InodeEntry::Leaf { leaf, .. } => Some(Arc::clone(leaf)),
            InodeEntry::Dir { .. } => None,
        }
    }

    // ===== open / read / release =====

    /// Validates open flags, materializes the asset and opens a reader.
    /// Returns the file handle id.
    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        if ino == EPOCH_INO {
            return Ok(0);
        }
        let leaf = match self.leaf_of(ino) {
            Some(leaf) => leaf,
            None => return Err(libc::ENOENT),
        };

        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(libc::EACCES);
        }
        if flags & (libc::O_TRUNC | libc::O_APPEND | libc::O_CREAT | libc::O_EXCL) != 0 {
            return Err(libc::EACCES);
        }
        let supported = libc::O_ACCMODE
            | libc::O_NONBLOCK
            | libc::O_LARGEFILE
            | libc::O_CLOEXEC
            | libc::O_NOFOLLOW
            | libc::O_NOATIME;
        if flags & !supported != 0 {
            debug!(flags, "rejecting open with unsupported flags");
            return Err(libc::EINVAL);
        }

        let cancel = CancelToken::new();
        let asset = leaf.to_asset();
        self.prefetcher
            .materialize(&cancel, &asset)
            .map_err(errno_of)?;
        let reader = self
            .prefetcher
            .random_access_stream(&cancel, &asset, 0, 0)
            .map_err(errno_of)?;

        let fh = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, OpenHandle { ino, reader });
        Ok(fh)
    }

    pub fn read(&self, ino: u64, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        if ino == EPOCH_INO {
            let content = self.state.read().epoch_content().into_bytes();
            let start = (offset as usize).min(content.len());
            let end = (start + size as usize).min(content.len());
            return Ok(content[start..end].to_vec());
        }

        if self.options.fail_reads && size > 0 {
            // Diagnostic mode: consumers are expected to use digests
            // only and must never reach for the bytes.
            return Err(libc::EBADF);
        }

        let handles = self.handles.read();
        let handle = match handles.get(&fh) {
            Some(handle) if handle.ino == ino => handle,
            _ => return Err(libc::EBADF),
        };
        let mut buf = vec![0u8; size as usize];
        match handle.reader.read_at(&mut buf, offset) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    /// Closes a handle; the reader's drop releases its resources, and a
    /// second release of the same handle is a no-op.
    pub fn release(&self, fh: u64) {
        self.handles.write().remove(&fh);
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.read().len()
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }
}

fn root_child_names(state: &FsState) -> Vec<String> {
    match state.inodes.get(&ROOT_INO) {
        Some(InodeEntry::Dir { children, .. }) => {
            children.iter().map(|(name, _)| name.clone()).collect()
        }
        _ => Vec::new(),
    }
}

/// Maps data-plane errors onto the errno the kernel boundary speaks.
/// The human-readable cause goes to the log, never to the caller.
pub fn errno_of(error: Error) -> i32 {
    warn!(error = %error, "filesystem operation failed");
    match error {
        Error::NotFound { .. } => libc::ENOENT,
        Error::Cancelled => libc::EINTR,
        Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        _ => libc::EIO,
    }
}
