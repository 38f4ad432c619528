//! # assetfs-prefetch
//!
//! The engine that decides where an asset's bytes come from and how far
//! they travel. Three verbs:
//!
//! - [`Prefetcher::digest_of`] resolves an asset to its digest without
//!   necessarily moving bytes anywhere;
//! - [`Prefetcher::prefetch`] ensures the blob exists in the *remote*
//!   CAS (so remote execution can consume it without the bytes ever
//!   touching this machine);
//! - [`Prefetcher::materialize`] ensures the blob exists in the *local*
//!   CAS for reading.
//!
//! Fallback order is always: checksum cache, remote CAS, remote asset
//! resolver, direct download. Transport failures fall through to the
//! next tier with a warning; integrity failures terminate the request.

pub mod handle;
pub mod workqueue;

pub use handle::StreamingHandle;
pub use workqueue::WorkQueue;

use std::io::{Read, Write};
use std::sync::Arc;

use assetfs_cas::{
    Asset, BlobChecker, BlobData, BlobReader, BlobWriter, CancelToken, Cas, Error, LocalCas,
    RandomAccessReader, Result,
};
use assetfs_integrity::{Algorithm, ChecksumCache, Digest};
use assetfs_remote::AssetFetcher;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Blobs at or above this size move between CAS tiers over the byte
/// stream; smaller blobs are coalesced into batched unary calls. 1 MiB
/// is where RPC framing overhead stops dominating transfer cost.
pub const BYTESTREAM_THRESHOLD: i64 = 1 << 20;

pub struct Prefetcher {
    local_cas: Arc<dyn LocalCas>,
    remote_cas: Option<Arc<dyn Cas>>,
    remote_asset: Option<Arc<dyn AssetFetcher>>,
    downloader: Option<Arc<dyn AssetFetcher>>,
    checksum_cache: Arc<ChecksumCache>,
    digest_function: Algorithm,
    background: Mutex<Option<WorkQueue<Asset>>>,
}

impl Prefetcher {
    pub fn new(
        local_cas: Arc<dyn LocalCas>,
        remote_cas: Option<Arc<dyn Cas>>,
        remote_asset: Option<Arc<dyn AssetFetcher>>,
        downloader: Option<Arc<dyn AssetFetcher>>,
        checksum_cache: Arc<ChecksumCache>,
        digest_function: Algorithm,
    ) -> Prefetcher {
        Prefetcher {
            local_cas,
            remote_cas,
            remote_asset,
            downloader,
            checksum_cache,
            digest_function,
            background: Mutex::new(None),
        }
    }

    pub fn digest_function(&self) -> Algorithm {
        self.digest_function
    }

    pub fn checksum_cache(&self) -> &Arc<ChecksumCache> {
        &self.checksum_cache
    }

    /// Returns the digest of the asset's content under the primary
    /// algorithm, learning it if needed: checksum cache, then remote
    /// asset resolution, then a direct-download probe.
    pub fn digest_of(&self, cancel: &CancelToken, asset: &Asset) -> Result<Digest> {
        if let Some(digest) = self.checksum_cache.from_integrity(&asset.integrity) {
            return Ok(digest);
        }
        let digest = self.learn_digest(cancel, asset)?;
        self.record_learned(asset, digest);
        Ok(digest)
    }

    fn learn_digest(&self, cancel: &CancelToken, asset: &Asset) -> Result<Digest> {
        let mut last_error: Option<Error> = None;
        if let Some(remote_asset) = &self.remote_asset {
            match remote_asset.fetch_blob(cancel, None, None, asset, self.digest_function) {
                Ok(response) => return Ok(response.blob_digest),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "resolving digest via remote asset service failed, trying direct download");
                    last_error = Some(e);
                }
            }
        }
        if let Some(downloader) = &self.downloader {
            match downloader.fetch_blob(cancel, None, None, asset, self.digest_function) {
                Ok(response) => return Ok(response.blob_digest),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "resolving digest via direct download failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::Unsupported(
            "no service configured that could resolve an asset digest",
        )))
    }

    fn record_learned(&self, asset: &Asset, digest: Digest) {
        if digest.uninitialized() {
            return;
        }
        info!(
            integrity = ?asset.integrity.to_sri_list(),
            digest = %digest.hex(self.digest_function),
            size = digest.size_bytes,
            "learned new digest association"
        );
        self.checksum_cache.put_integrity(&asset.integrity, digest);
    }

    /// Ensures the asset's blob is present in the remote CAS and returns
    /// its digest. Never guarantees local availability.
    pub fn prefetch(&self, cancel: &CancelToken, asset: &Asset) -> Result<Digest> {
        let remote_asset = self
            .remote_asset
            .as_ref()
            .ok_or(Error::Unsupported("prefetch without a remote asset service"))?;

        let known_digest = self.checksum_cache.from_integrity(&asset.integrity);

        if let (Some(remote_cas), Some(known)) = (&self.remote_cas, known_digest) {
            // Cheap check first: the remote CAS may already hold the blob.
            let missing =
                remote_cas.find_missing_blobs(cancel, &[known], self.digest_function)?;
            if missing.is_empty() {
                return Ok(known);
            }
        }

        let response = remote_asset.fetch_blob(cancel, None, None, asset, self.digest_function)?;
        match known_digest {
            Some(known) => {
                if !known.equals(&response.blob_digest, self.digest_function) {
                    return Err(Error::RemoteAssetIntegrity {
                        expected: known.hex(self.digest_function),
                        actual: response.blob_digest.hex(self.digest_function),
                    });
                }
            }
            None => self.record_learned(asset, response.blob_digest),
        }
        Ok(response.blob_digest)
    }

    /// Ensures the asset's blob is present in the local CAS. Stops as
    /// soon as the local store has the expected bytes; never guarantees
    /// remote availability.
    pub fn materialize(&self, cancel: &CancelToken, asset: &Asset) -> Result<()> {
        if let Some(digest) = self.checksum_cache.from_integrity(&asset.integrity) {
            return self.materialize_with_digest(cancel, asset, digest);
        }

        // Digest unknown: try to learn it by prefetching remotely.
        match self.prefetch(cancel, asset) {
            Ok(digest) => return self.materialize_with_digest(cancel, asset, digest),
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                debug!(error = %e, "prefetch during materialization failed, falling back to direct download");
            }
        }

        // Digest still unknown: direct download is the only option left.
        let downloader = self
            .downloader
            .as_ref()
            .ok_or(Error::Unsupported("materialize without a downloader"))?;
        let response = downloader.fetch_blob(cancel, None, None, asset, self.digest_function)?;
        self.record_learned(asset, response.blob_digest);
        Ok(())
    }

    fn materialize_with_digest(
        &self,
        cancel: &CancelToken,
        asset: &Asset,
        digest: Digest,
    ) -> Result<()> {
        let missing = self
            .local_cas
            .find_missing_blobs(cancel, &[digest], self.digest_function)?;
        if missing.is_empty() {
            return Ok(());
        }

        // Not local. Remote sources in order: remote CAS by digest,
        // remote CAS refilled through the asset service, direct download.
        let mut available_remotely = false;
        if let Some(remote_cas) = &self.remote_cas {
            let missing_remote =
                remote_cas.find_missing_blobs(cancel, &missing, self.digest_function)?;
            available_remotely = missing_remote.is_empty();
        }

        if !available_remotely && self.remote_asset.is_some() && self.remote_cas.is_some() {
            let remote_asset = self.remote_asset.as_ref().expect("checked above");
            match remote_asset.fetch_blob(cancel, None, None, asset, self.digest_function) {
                Ok(response) => {
                    if !digest.equals(&response.blob_digest, self.digest_function) {
                        return Err(Error::RemoteAssetIntegrity {
                            expected: digest.hex(self.digest_function),
                            actual: response.blob_digest.hex(self.digest_function),
                        });
                    }
                    available_remotely = true;
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "remote asset fetch failed, falling back to direct download");
                }
            }
        }

        if available_remotely {
            match self.transfer_remote_to_local(cancel, &[digest]) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "remote-to-local transfer failed, falling back to direct download");
                }
            }
        }

        let downloader = self
            .downloader
            .as_ref()
            .ok_or(Error::Unsupported("materialize without a downloader"))?;
        downloader.fetch_blob(cancel, None, None, asset, self.digest_function)?;
        debug!(
            digest = %digest.hex(self.digest_function),
            size = digest.size_bytes,
            "downloaded asset directly"
        );
        Ok(())
    }

    /// Moves blobs from the remote to the local CAS in contiguous
    /// chunks: a head blob at or above [`BYTESTREAM_THRESHOLD`] is
    /// streamed, otherwise the longest prefix whose cumulative size
    /// stays below the threshold goes through one batched round trip.
    ///
    /// Also used by bulk tooling that warms the local cache for many
    /// assets at once.
    pub fn transfer_remote_to_local(
        &self,
        cancel: &CancelToken,
        digests: &[Digest],
    ) -> Result<()> {
        let remote_cas = self.remote_cas.as_ref().ok_or(Error::Unsupported(
            "remote-to-local transfer without a remote CAS",
        ))?;
        let mut remaining = digests;
        while !remaining.is_empty() {
            remaining = self.transfer_part(cancel, remote_cas, remaining)?;
        }
        Ok(())
    }

    fn transfer_part<'a>(
        &self,
        cancel: &CancelToken,
        remote_cas: &Arc<dyn Cas>,
        digests: &'a [Digest],
    ) -> Result<&'a [Digest]> {
        let head = &digests[0];
        if head.size_bytes >= BYTESTREAM_THRESHOLD {
            debug!(
                digest = %head.hex(self.digest_function),
                size = head.size_bytes,
                "streaming large blob from remote to local CAS"
            );
            let mut reader =
                remote_cas.read_stream(cancel, head, self.digest_function, 0, 0)?;
            let mut writer = self
                .local_cas
                .write_stream(cancel, head, self.digest_function)?;
            let mut transferred: i64 = 0;
            let mut buf = [0u8; 64 * 1024];
            loop {
                cancel.check()?;
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n])?;
                transferred += n as i64;
            }
            if transferred != head.size_bytes {
                return Err(Error::ShortOrLongRead {
                    expected: head.size_bytes,
                    actual: transferred,
                });
            }
            writer.commit()?;
            return Ok(&digests[1..]);
        }

        // Greedy prefix of small blobs for one batched round trip.
        let mut cumulative: i64 = 0;
        let mut count = 0;
        for digest in digests {
            if cumulative + digest.size_bytes >= BYTESTREAM_THRESHOLD {
                break;
            }
            cumulative += digest.size_bytes;
            count += 1;
        }

        let batch = &digests[..count];
        let responses = remote_cas
            .batch_read_blobs(cancel, batch, self.digest_function)?
            .into_ok()?;
        if responses.len() != count {
            return Err(Error::Protocol(format!(
                "unexpected number of batch read responses: expected {count}, got {}",
                responses.len()
            )));
        }

        let blobs: Vec<BlobData> = responses
            .into_iter()
            .zip(batch)
            .map(|(response, digest)| BlobData {
                digest: *digest,
                data: response.data.unwrap_or_default(),
            })
            .collect();
        let updated = self
            .local_cas
            .batch_update_blobs(cancel, &blobs, self.digest_function)?
            .into_ok()?;
        if updated.len() != count {
            return Err(Error::Protocol(format!(
                "unexpected number of batch update responses: expected {count}, got {}",
                updated.len()
            )));
        }
        Ok(&digests[count..])
    }

    /// Opens a positional reader over the asset's bytes.
    ///
    /// Small blobs (and all blobs when no remote CAS is configured) are
    /// materialized and read from the local store. Large blobs that are
    /// not already local are prefetched into the remote CAS and read
    /// through the streaming adapter, so their bytes never land on disk
    /// here.
    pub fn random_access_stream(
        &self,
        cancel: &CancelToken,
        asset: &Asset,
        offset: u64,
        limit: u64,
    ) -> Result<Box<dyn RandomAccessReader>> {
        let digest = self.digest_of(cancel, asset)?;
        let effective_limit = if limit == 0 {
            0
        } else {
            limit.min(digest.size_bytes.max(0) as u64)
        };

        let remote_cas = match &self.remote_cas {
            Some(remote_cas) if digest.size_bytes >= BYTESTREAM_THRESHOLD => remote_cas,
            _ => {
                // Small enough to keep locally, or nowhere to stream from.
                self.materialize(cancel, asset)?;
                return self.local_cas.read_random_access(
                    cancel,
                    &digest,
                    self.digest_function,
                    offset,
                    effective_limit,
                );
            }
        };

        let missing_local = self
            .local_cas
            .find_missing_blobs(cancel, &[digest], self.digest_function)?;
        if missing_local.is_empty() {
            return self.local_cas.read_random_access(
                cancel,
                &digest,
                self.digest_function,
                offset,
                effective_limit,
            );
        }

        self.prefetch(cancel, asset)?;
        debug!(
            digest = %digest.hex(self.digest_function),
            size = digest.size_bytes,
            "streaming asset from remote CAS"
        );
        let reader: Arc<dyn assetfs_cas::BlobReader> = remote_cas.clone();
        Ok(Box::new(StreamingHandle::new(
            reader,
            digest,
            self.digest_function,
            offset,
        )))
    }

    /// Starts background workers that service [`Prefetcher::enqueue_prefetch`].
    pub fn start_background(self: &Arc<Self>, workers: usize) {
        let mut slot = self.background.lock();
        if slot.is_some() {
            return;
        }
        let prefetcher = Arc::clone(self);
        *slot = Some(WorkQueue::start(workers, move |asset: Asset| {
            let cancel = CancelToken::new();
            if let Err(e) = prefetcher.prefetch(&cancel, &asset) {
                warn!(error = %e, "background prefetch failed");
            }
        }));
    }

    /// Stops the background workers after draining the queue.
    pub fn stop_background(&self) {
        if let Some(mut queue) = self.background.lock().take() {
            queue.stop();
        }
    }

    /// Hints that the asset will be needed remotely soon. Runs on the
    /// background queue when started, inline otherwise; failures are
    /// logged, never surfaced.
    pub fn enqueue_prefetch(&self, asset: Asset) {
        let queued = {
            let slot = self.background.lock();
            match slot.as_ref() {
                Some(queue) => queue.enqueue(asset.clone()),
                None => false,
            }
        };
        if !queued {
            let cancel = CancelToken::new();
            if let Err(e) = self.prefetch(&cancel, &asset) {
                warn!(error = %e, "prefetch failed");
            }
        }
    }
}
