//! On-disk content-addressable blob store.
//!
//! Layout per algorithm, compatible with a Bazel-style disk cache rooted
//! at `<root>/<algorithm>`:
//!
//! ```text
//! <root>/<algorithm>/cas/<hh>/<hex>   # completed blobs
//! <root>/<algorithm>/staging/         # in-flight writes
//! ```
//!
//! `<hh>` is the first two hex digits of the blob's hex digest. Writes go
//! through a staging file that is fully written, fsynced, digest-verified
//! and then atomically renamed into place. Racing writers both succeed:
//! the final name is content-addressed, so whoever renames last wins with
//! identical bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use assetfs_integrity::{Algorithm, Checksum, Digest, Hasher, Integrity};
use tracing::{debug, warn};

use crate::{
    BatchReadOutcome, BatchUpdateOutcome, BlobChecker, BlobData, BlobReader, BlobSink, BlobStream,
    BlobWriter, CancelToken, Error, ImportSource, LocalCas, RandomAccessReader, ReadBlobResponse,
    Result, Status, StatusCode, UpdateBlobResponse,
};

/// Counter making staging file names unique within the process.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct DiskCas {
    root: PathBuf,
}

impl DiskCas {
    /// Opens (and if necessary initializes) a disk CAS rooted at `root`.
    ///
    /// The staging directories are cleared: they only ever contain
    /// leftovers of writes the previous process abandoned, and the store
    /// assumes exclusive ownership of its root.
    pub fn new(root: impl Into<PathBuf>) -> Result<DiskCas> {
        let cas = DiskCas { root: root.into() };
        cas.initialize_layout()?;
        Ok(cas)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn initialize_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        for algorithm in Algorithm::ALL {
            let prefix = self.root.join(algorithm.name());
            let cas_dir = prefix.join("cas");
            fs::create_dir_all(&cas_dir)?;
            for i in 0..256 {
                let shard = cas_dir.join(format!("{i:02x}"));
                match fs::create_dir(&shard) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
            }
            let staging = prefix.join("staging");
            fs::create_dir_all(&staging)?;
            for entry in fs::read_dir(&staging)? {
                let entry = entry?;
                debug!(path = %entry.path().display(), "removing stale staging file");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn blob_path(&self, checksum: &Checksum) -> PathBuf {
        let hex = checksum.hex();
        self.root
            .join(checksum.algorithm.name())
            .join("cas")
            .join(&hex[..2])
            .join(&hex)
    }

    fn staging_dir(&self, algorithm: Algorithm) -> PathBuf {
        self.root.join(algorithm.name()).join("staging")
    }

    fn open_blob(&self, digest: &Digest, digest_function: Algorithm) -> Result<File> {
        let path = self.blob_path(&digest.checksum(digest_function));
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound {
                    digest: digest.hex(digest_function),
                }
            } else {
                e.into()
            }
        })
    }

    fn staging_writer(&self, digest: &Digest, digest_function: Algorithm) -> Result<StagingWriter> {
        let hex = digest.hex(digest_function);
        let unique = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let staging_path = self
            .staging_dir(digest_function)
            .join(format!("{hex}-{}-{unique}", std::process::id()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging_path)?;
        // Best-effort preallocation to the expected size.
        let _ = file.set_len(digest.size_bytes.max(0) as u64);
        Ok(StagingWriter {
            file: Some(file),
            staging_path,
            final_path: self.blob_path(&digest.checksum(digest_function)),
            digest: *digest,
            digest_function,
            hasher: Some(digest_function.hasher()),
            written: 0,
            committed: false,
        })
    }
}

impl BlobChecker for DiskCas {
    fn find_missing_blobs(
        &self,
        cancel: &CancelToken,
        digests: &[Digest],
        digest_function: Algorithm,
    ) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        for digest in digests {
            cancel.check()?;
            let path = self.blob_path(&digest.checksum(digest_function));
            match fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => return Err(Error::CacheCorrupt(path)),
                Ok(meta) if meta.is_file() => {}
                Ok(_) => missing.push(*digest),
                Err(e) if e.kind() == io::ErrorKind::NotFound => missing.push(*digest),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(missing)
    }
}

impl BlobReader for DiskCas {
    fn batch_read_blobs(
        &self,
        cancel: &CancelToken,
        digests: &[Digest],
        digest_function: Algorithm,
    ) -> Result<BatchReadOutcome> {
        let mut responses = Vec::with_capacity(digests.len());
        for digest in digests {
            cancel.check()?;
            let path = self.blob_path(&digest.checksum(digest_function));
            let response = match fs::read(&path) {
                Ok(data) => ReadBlobResponse {
                    digest: *digest,
                    data: Some(data),
                    status: Status::ok(),
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => ReadBlobResponse {
                    digest: *digest,
                    data: None,
                    status: Status::new(StatusCode::NotFound, e.to_string()),
                },
                Err(e) => ReadBlobResponse {
                    digest: *digest,
                    data: None,
                    status: Status::new(StatusCode::Unknown, e.to_string()),
                },
            };
            responses.push(response);
        }
        Ok(BatchReadOutcome { responses })
    }

    fn read_stream(
        &self,
        cancel: &CancelToken,
        digest: &Digest,
        digest_function: Algorithm,
        offset: u64,
        limit: u64,
    ) -> Result<Box<dyn BlobStream>> {
        cancel.check()?;
        let mut file = self.open_blob(digest, digest_function)?;
        file.seek(SeekFrom::Start(offset))?;
        if limit == 0 {
            Ok(Box::new(file))
        } else {
            Ok(Box::new(file.take(limit)))
        }
    }
}

impl BlobWriter for DiskCas {
    fn batch_update_blobs(
        &self,
        cancel: &CancelToken,
        blobs: &[BlobData],
        digest_function: Algorithm,
    ) -> Result<BatchUpdateOutcome> {
        let mut responses = Vec::with_capacity(blobs.len());
        for blob in blobs {
            cancel.check()?;
            let status = match self.write_one(cancel, blob, digest_function) {
                Ok(()) => Status::ok(),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                    Status::new(StatusCode::PermissionDenied, e.to_string())
                }
                Err(e @ Error::ChecksumMismatch { .. }) => {
                    Status::new(StatusCode::FailedPrecondition, e.to_string())
                }
                Err(e) => Status::new(StatusCode::Internal, e.to_string()),
            };
            responses.push(UpdateBlobResponse {
                digest: blob.digest,
                status,
            });
        }
        Ok(BatchUpdateOutcome { responses })
    }

    fn write_stream(
        &self,
        cancel: &CancelToken,
        digest: &Digest,
        digest_function: Algorithm,
    ) -> Result<Box<dyn BlobSink>> {
        cancel.check()?;
        Ok(Box::new(self.staging_writer(digest, digest_function)?))
    }
}

impl DiskCas {
    fn write_one(
        &self,
        cancel: &CancelToken,
        blob: &BlobData,
        digest_function: Algorithm,
    ) -> Result<()> {
        cancel.check()?;
        let mut writer = self.staging_writer(&blob.digest, digest_function)?;
        writer.write_all(&blob.data)?;
        Box::new(writer).commit()
    }
}

impl LocalCas for DiskCas {
    fn read_random_access(
        &self,
        cancel: &CancelToken,
        digest: &Digest,
        digest_function: Algorithm,
        offset: u64,
        limit: u64,
    ) -> Result<Box<dyn RandomAccessReader>> {
        cancel.check()?;
        let file = self.open_blob(digest, digest_function)?;
        let end = if limit == 0 {
            None
        } else {
            Some(offset.saturating_add(limit))
        };
        Ok(Box::new(BlobFileReader { file, end }))
    }

    fn import_blob(
        &self,
        cancel: &CancelToken,
        prevalidated_integrity: &Integrity,
        optional_digest: Option<Digest>,
        digest_function: Algorithm,
        source: ImportSource,
    ) -> Result<Digest> {
        cancel.check()?;
        let known_checksum = match optional_digest {
            Some(d) if !d.uninitialized() => d.checksum(digest_function),
            _ => prevalidated_integrity
                .checksum_for(digest_function)
                .ok_or(Error::MissingChecksum)?,
        };
        if known_checksum.is_empty() {
            return Err(Error::MissingChecksum);
        }

        let target = self.blob_path(&known_checksum);
        match source {
            ImportSource::File(path) => {
                match fs::hard_link(&path, &target) {
                    Ok(()) => {}
                    // Content-addressed: an existing target has the same bytes.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(_) => {
                        // Cross-device or unsupported; fall back to an
                        // atomic copy through staging.
                        let mut file = File::open(&path)?;
                        self.copy_into_place(cancel, &mut file, &target)?;
                    }
                }
            }
            ImportSource::Reader(mut reader) => {
                self.copy_into_place(cancel, &mut reader, &target)?;
            }
        }

        let size = fs::metadata(&target)?.len() as i64;
        Ok(Digest::new(&known_checksum.hash, size, digest_function)?)
    }
}

impl DiskCas {
    /// Copies `reader` to `target` atomically: stage in the same
    /// directory, fsync, rename.
    fn copy_into_place(
        &self,
        cancel: &CancelToken,
        reader: &mut dyn Read,
        target: &Path,
    ) -> Result<()> {
        let unique = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = target.with_extension(format!("tmp-{}-{unique}", std::process::id()));
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        let result = (|| -> Result<()> {
            let mut buf = [0u8; 64 * 1024];
            loop {
                cancel.check()?;
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])?;
            }
            file.sync_all()?;
            fs::rename(&tmp, target)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

/// Random access over a completed blob file. `end` caps the readable
/// window when the handle was opened with a limit.
struct BlobFileReader {
    file: File,
    end: Option<u64>,
}

impl RandomAccessReader for BlobFileReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        let max = match self.end {
            Some(end) if offset >= end => return Ok(0),
            Some(end) => ((end - offset) as usize).min(buf.len()),
            None => buf.len(),
        };
        self.file.read_at(&mut buf[..max], offset)
    }
}

/// In-flight blob write. The staged bytes are hashed as they are
/// written; `commit` verifies both size and digest before renaming the
/// staging file into its content-addressed location. An uncommitted
/// writer removes its staging file on drop.
struct StagingWriter {
    file: Option<File>,
    staging_path: PathBuf,
    final_path: PathBuf,
    digest: Digest,
    digest_function: Algorithm,
    hasher: Option<Box<dyn Hasher>>,
    written: i64,
    committed: bool,
}

impl Write for StagingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("write after commit"))?;
        let n = file.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        self.written += n as i64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl BlobSink for StagingWriter {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let file = self.file.take().ok_or_else(|| io::Error::other("double commit"))?;
        // set_len preallocated the file; trim any tail we did not write.
        file.set_len(self.written.max(0) as u64)?;
        file.sync_all()?;
        drop(file);

        if self.written != self.digest.size_bytes {
            return Err(Error::ShortOrLongRead {
                expected: self.digest.size_bytes,
                actual: self.written,
            });
        }
        let got = self
            .hasher
            .take()
            .expect("hasher present until commit")
            .finalize();
        if got != self.digest.hash_bytes(self.digest_function) {
            return Err(Error::ChecksumMismatch {
                algorithm: self.digest_function.name(),
                expected: self.digest.hex(self.digest_function),
                actual: hex::encode(&got),
            });
        }

        fs::rename(&self.staging_path, &self.final_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagingWriter {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_file(&self.staging_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %self.staging_path.display(),
                        error = %e,
                        "failed to remove staging file"
                    );
                }
            }
        }
    }
}
