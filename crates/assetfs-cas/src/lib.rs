//! # assetfs-cas
//!
//! Content-addressable storage abstraction for assetfs.
//!
//! The trait surface is modeled after the remote-execution API's
//! ContentAddressableStorage service, split into checker / reader /
//! writer capabilities, without assuming the store is remote or local.
//! [`disk::DiskCas`] is the on-disk implementation; the remote client
//! lives in `assetfs-remote`.

pub mod cancel;
pub mod disk;
pub mod status;

pub use cancel::CancelToken;
pub use disk::DiskCas;
pub use status::{Status, StatusCode};

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use assetfs_integrity::{Algorithm, Digest, Integrity, IntegrityError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found: {digest}")]
    NotFound { digest: String },

    #[error("cache corrupt: blob path {} is a directory", .0.display())]
    CacheCorrupt(PathBuf),

    #[error("invalid {algorithm} checksum: expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("remote-asset-integrity: fetch returned digest {actual}, expected {expected}")]
    RemoteAssetIntegrity { expected: String, actual: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("batch response has non-OK status")]
    BatchStatus,

    #[error("import called without a prevalidated checksum")]
    MissingChecksum,

    #[error("expected to transfer {expected} bytes, got {actual}")]
    ShortOrLongRead { expected: i64, actual: i64 },
}

impl Error {
    /// Not-found at one storage tier is not fatal for the prefetcher; it
    /// selects the next fallback. This predicate keeps that decision in
    /// one place.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Errors that must never be swallowed by tier fallback: integrity
    /// disagreements and cancellation terminate the whole operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::ChecksumMismatch { .. }
                | Error::RemoteAssetIntegrity { .. }
                | Error::Integrity(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A reference to remotely addressable content: mirror URIs, the declared
/// integrity, optional request qualifiers and an optional size hint
/// (-1 when unknown). This is metadata only, never the bytes.
#[derive(Debug, Clone, Default)]
pub struct Asset {
    pub uris: Vec<String>,
    pub integrity: Integrity,
    pub qualifiers: BTreeMap<String, String>,
    pub size_hint: i64,
}

impl Asset {
    pub fn new(uris: Vec<String>, integrity: Integrity) -> Asset {
        Asset {
            uris,
            integrity,
            qualifiers: BTreeMap::new(),
            size_hint: -1,
        }
    }
}

/// One entry of a batched read: the digest that was asked for, the bytes
/// (when status is OK) and the per-entry status.
#[derive(Debug)]
pub struct ReadBlobResponse {
    pub digest: Digest,
    pub data: Option<Vec<u8>>,
    pub status: Status,
}

#[derive(Debug)]
pub struct UpdateBlobResponse {
    pub digest: Digest,
    pub status: Status,
}

/// The outcome of a batched read. Per-entry results are always present;
/// `into_ok` collapses any per-entry failure into [`Error::BatchStatus`]
/// for callers that cannot use partial results.
#[derive(Debug)]
pub struct BatchReadOutcome {
    pub responses: Vec<ReadBlobResponse>,
}

impl BatchReadOutcome {
    pub fn has_failures(&self) -> bool {
        self.responses
            .iter()
            .any(|r| r.data.is_none() || !r.status.is_ok())
    }

    pub fn into_ok(self) -> Result<Vec<ReadBlobResponse>> {
        if self.has_failures() {
            return Err(Error::BatchStatus);
        }
        Ok(self.responses)
    }
}

/// The outcome of a batched update, mirroring [`BatchReadOutcome`].
#[derive(Debug)]
pub struct BatchUpdateOutcome {
    pub responses: Vec<UpdateBlobResponse>,
}

impl BatchUpdateOutcome {
    pub fn has_failures(&self) -> bool {
        self.responses.iter().any(|r| !r.status.is_ok())
    }

    pub fn into_ok(self) -> Result<Vec<UpdateBlobResponse>> {
        if self.has_failures() {
            return Err(Error::BatchStatus);
        }
        Ok(self.responses)
    }
}

/// One entry of a batched update.
#[derive(Debug, Clone)]
pub struct BlobData {
    pub digest: Digest,
    pub data: Vec<u8>,
}

pub trait BlobChecker: Send + Sync {
    /// Returns the subset of `digests` that is not present in this store.
    fn find_missing_blobs(
        &self,
        cancel: &CancelToken,
        digests: &[Digest],
        digest_function: Algorithm,
    ) -> Result<Vec<Digest>>;
}

pub trait BlobReader: Send + Sync {
    /// Reads every requested blob into memory. Transport-level failures
    /// are errors; per-entry failures are reported in the outcome.
    fn batch_read_blobs(
        &self,
        cancel: &CancelToken,
        digests: &[Digest],
        digest_function: Algorithm,
    ) -> Result<BatchReadOutcome>;

    /// Opens a sequential stream over one blob. `limit == 0` means read
    /// until EOF. Dropping the stream releases the underlying resource.
    fn read_stream(
        &self,
        cancel: &CancelToken,
        digest: &Digest,
        digest_function: Algorithm,
        offset: u64,
        limit: u64,
    ) -> Result<Box<dyn BlobStream>>;
}

pub trait BlobWriter: Send + Sync {
    fn batch_update_blobs(
        &self,
        cancel: &CancelToken,
        blobs: &[BlobData],
        digest_function: Algorithm,
    ) -> Result<BatchUpdateOutcome>;

    /// Opens a staged writer for one blob. The write only becomes visible
    /// after a successful [`BlobSink::commit`]; dropping the sink without
    /// committing discards the staged bytes.
    fn write_stream(
        &self,
        cancel: &CancelToken,
        digest: &Digest,
        digest_function: Algorithm,
    ) -> Result<Box<dyn BlobSink>>;
}

pub trait Cas: BlobChecker + BlobReader + BlobWriter {}

impl<T: BlobChecker + BlobReader + BlobWriter> Cas for T {}

/// Sequential blob stream. Close semantics are drop semantics.
pub trait BlobStream: Read + Send {}

impl<T: Read + Send> BlobStream for T {}

/// Staged blob writer; `commit` verifies the content digest and promotes
/// the staged bytes into the store.
pub trait BlobSink: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Positional reads without a cursor. Offsets are absolute within the
/// blob. Implementations must tolerate concurrent `read_at` calls from
/// different threads without corrupting state (serializing internally is
/// acceptable).
pub trait RandomAccessReader: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// The source of an [`LocalCas::import_blob`]. A file-backed source may
/// be hardlinked into the store when both live on the same volume.
pub enum ImportSource {
    /// A file on disk, referenced by path.
    File(PathBuf),
    /// An arbitrary byte stream.
    Reader(Box<dyn Read + Send>),
}

/// A CAS that also supports random access reads and a validated-import
/// fast path. Only the on-disk store implements this.
pub trait LocalCas: Cas {
    /// Opens a blob for positional reads. The readable window is
    /// `[offset, offset + limit)`; `limit == 0` means until EOF.
    fn read_random_access(
        &self,
        cancel: &CancelToken,
        digest: &Digest,
        digest_function: Algorithm,
        offset: u64,
        limit: u64,
    ) -> Result<Box<dyn RandomAccessReader>>;

    /// Imports a blob whose integrity the *caller* has already validated,
    /// skipping re-hashing. `optional_digest` supplies the known digest
    /// under `digest_function` when available; otherwise a checksum for
    /// `digest_function` must be present in `prevalidated_integrity`.
    /// Returns the authoritative digest (size observed on completion).
    fn import_blob(
        &self,
        cancel: &CancelToken,
        prevalidated_integrity: &Integrity,
        optional_digest: Option<Digest>,
        digest_function: Algorithm,
        source: ImportSource,
    ) -> Result<Digest>;
}
