//! Thin `fuser` binding over [`AssetFs`].
//!
//! Every callback delegates to the transport-independent core and only
//! translates types and reply protocols. Entry and attribute TTLs are
//! kept short so manifest reloads become visible without kernel
//! notification support.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyXattr, Request,
};
use tracing::debug;

use crate::fs::{AssetFs, NodeAttr, NodeKind};

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u64 = 512;

/// Ownership shim: `fuser` wants to own its `Filesystem` value, the
/// watcher keeps using the same core through the shared `Arc`.
pub struct AssetFuse {
    fs: Arc<AssetFs>,
}

impl AssetFuse {
    pub fn new(fs: Arc<AssetFs>) -> AssetFuse {
        AssetFuse { fs }
    }

    fn file_attr(&self, attr: &NodeAttr) -> FileAttr {
        let kind = match attr.kind {
            NodeKind::Directory => FileType::Directory,
            NodeKind::File => FileType::RegularFile,
        };
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.size.div_ceil(BLOCK_SIZE),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: attr.perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE as u32,
        }
    }
}

impl Filesystem for AssetFuse {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.lookup(parent, name) {
            Some(attr) => reply.entry(&TTL, &self.file_attr(&attr), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Some(attr) => reply.attr(&TTL, &self.file_attr(&attr)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(entries) = self.fs.readdir(ino) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            let kind = match kind {
                NodeKind::Directory => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            };
            if reply.add(*entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(ino, fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.fs.getxattr(ino, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() as u32 <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let names = self.fs.listxattr(ino);
        let mut packed = Vec::new();
        for name in &names {
            packed.extend_from_slice(name.as_bytes());
            packed.push(0);
        }
        if size == 0 {
            reply.size(packed.len() as u32);
        } else if packed.len() as u32 <= size {
            reply.data(&packed);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    // The surface is read-only; every mutation is denied outright.

    fn setattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EACCES);
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EACCES);
    }

    fn removexattr(&mut self, _req: &Request, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EACCES);
    }

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EACCES);
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EACCES);
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EACCES);
    }
}

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::RO,
        MountOption::FSName("assetfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ]
}

/// Mounts and blocks until the filesystem is unmounted.
pub fn mount(fs: Arc<AssetFs>, mountpoint: &Path) -> std::io::Result<()> {
    debug!(mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(AssetFuse::new(fs), mountpoint, &mount_options())
}

/// Mounts in the background; dropping the session unmounts.
pub fn spawn_mount(
    fs: Arc<AssetFs>,
    mountpoint: &Path,
) -> std::io::Result<fuser::BackgroundSession> {
    fuser::spawn_mount2(AssetFuse::new(fs), mountpoint, &mount_options())
}
