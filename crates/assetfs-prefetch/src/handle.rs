//! Random-access emulation over a forward-only remote byte stream.

use std::io::{self, Read};
use std::sync::Arc;

use assetfs_cas::{BlobReader, BlobStream, CancelToken, RandomAccessReader};
use assetfs_integrity::{Algorithm, Digest};
use parking_lot::Mutex;
use tracing::trace;

/// Forward seeks shorter than this are served by discarding bytes from
/// the open stream instead of reopening at the target offset.
const SEEK_DISCARD_THRESHOLD: u64 = 1 << 20;

/// A file handle streaming a remote blob while emulating positional
/// reads.
///
/// The byte stream only moves forward, so `read_at` at a foreign offset
/// closes the stream and reopens it server-side at that offset (short
/// forward distances are skipped over instead). All state is behind one
/// mutex: concurrent callers are serialized, never corrupted.
///
/// The connection is made lazily on the first read, so handles that are
/// opened and closed without reading cost no RPC.
pub struct StreamingHandle {
    remote: Arc<dyn BlobReader>,
    digest: Digest,
    digest_function: Algorithm,
    cancel: CancelToken,
    state: Mutex<StreamState>,
}

struct StreamState {
    source: Option<Box<dyn BlobStream>>,
    source_offset: u64,
}

impl StreamingHandle {
    pub fn new(
        remote: Arc<dyn BlobReader>,
        digest: Digest,
        digest_function: Algorithm,
        offset: u64,
    ) -> StreamingHandle {
        StreamingHandle {
            remote,
            digest,
            digest_function,
            cancel: CancelToken::new(),
            state: Mutex::new(StreamState {
                source: None,
                source_offset: offset,
            }),
        }
    }

    fn reopen_at(&self, offset: u64) -> io::Result<Box<dyn BlobStream>> {
        let size = self.digest.size_bytes.max(0) as u64;
        let limit = size.saturating_sub(offset);
        trace!(offset, limit, "reopening remote byte stream");
        self.remote
            .read_stream(&self.cancel, &self.digest, self.digest_function, offset, limit)
            .map_err(io::Error::other)
    }
}

impl RandomAccessReader for StreamingHandle {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let size = self.digest.size_bytes.max(0) as u64;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();

        if state.source.is_some() && offset != state.source_offset {
            let reusable = offset > state.source_offset
                && offset - state.source_offset < SEEK_DISCARD_THRESHOLD;
            if reusable {
                // Skip forward on the open stream.
                let mut remaining = offset - state.source_offset;
                let mut scratch = [0u8; 16 * 1024];
                let source = state.source.as_mut().expect("source checked above");
                while remaining > 0 {
                    let want = (remaining as usize).min(scratch.len());
                    let n = source.read(&mut scratch[..want])?;
                    if n == 0 {
                        break;
                    }
                    remaining -= n as u64;
                }
                state.source_offset = offset - remaining;
                if remaining > 0 {
                    // Stream ended before the target offset.
                    return Ok(0);
                }
            } else {
                // Backward or far-forward seek: reconnect at the target.
                state.source = None;
                state.source_offset = offset;
            }
        }

        if state.source.is_none() {
            state.source_offset = offset;
            state.source = Some(self.reopen_at(offset)?);
        }

        let source = state.source.as_mut().expect("source opened above");
        let n = source.read(buf)?;
        state.source_offset += n as u64;
        Ok(n)
    }
}

impl Drop for StreamingHandle {
    fn drop(&mut self) {
        // Cancel before the stream drops so the server side is released
        // even if the transport keeps buffers around.
        self.cancel.cancel();
        self.state.lock().source = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetfs_cas::{BatchReadOutcome, Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Remote blob reader serving from memory in fixed-size chunks and
    /// counting stream opens.
    struct ChunkedRemote {
        data: Vec<u8>,
        chunk: usize,
        opens: AtomicUsize,
    }

    impl BlobReader for ChunkedRemote {
        fn batch_read_blobs(
            &self,
            _cancel: &CancelToken,
            _digests: &[Digest],
            _digest_function: Algorithm,
        ) -> Result<BatchReadOutcome> {
            Err(Error::Unsupported("batch_read_blobs in test"))
        }

        fn read_stream(
            &self,
            _cancel: &CancelToken,
            _digest: &Digest,
            _digest_function: Algorithm,
            offset: u64,
            limit: u64,
        ) -> Result<Box<dyn BlobStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let start = (offset as usize).min(self.data.len());
            let end = if limit == 0 {
                self.data.len()
            } else {
                (start + limit as usize).min(self.data.len())
            };
            Ok(Box::new(ChunkedStream {
                data: self.data[start..end].to_vec(),
                pos: 0,
                chunk: self.chunk,
            }))
        }
    }

    struct ChunkedStream {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for ChunkedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = (self.data.len() - self.pos).min(self.chunk).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn handle_over(data: Vec<u8>, chunk: usize) -> (StreamingHandle, Arc<ChunkedRemote>) {
        let digest = Algorithm::Sha256.digest_of_bytes(&data);
        let remote = Arc::new(ChunkedRemote {
            data,
            chunk,
            opens: AtomicUsize::new(0),
        });
        (
            StreamingHandle::new(remote.clone(), digest, Algorithm::Sha256, 0),
            remote,
        )
    }

    fn read_fully(handle: &StreamingHandle, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut pos = 0;
        while pos < len {
            let n = handle
                .read_at(&mut out[pos..], offset + pos as u64)
                .unwrap();
            if n == 0 {
                break;
            }
            pos += n;
        }
        out.truncate(pos);
        out
    }

    #[test]
    fn sequential_reads_reuse_one_stream() {
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let (handle, remote) = handle_over(data.clone(), 1000);

        let got = read_fully(&handle, 0, data.len());
        assert_eq!(got, data);
        assert_eq!(remote.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn small_forward_seek_discards_instead_of_reopening() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7) as u8).collect();
        let (handle, remote) = handle_over(data.clone(), 4096);

        let mut buf = [0u8; 16];
        handle.read_at(&mut buf, 0).unwrap();
        // 100 KiB forward: below the discard threshold.
        let n = handle.read_at(&mut buf, 100_000).unwrap();
        assert_eq!(&buf[..n], &data[100_000..100_000 + n]);
        assert_eq!(remote.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backward_seek_reopens_the_stream() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 3) as u8).collect();
        let (handle, remote) = handle_over(data.clone(), 4096);

        let mut buf = [0u8; 16];
        handle.read_at(&mut buf, 40_000).unwrap();
        let n = handle.read_at(&mut buf, 10).unwrap();
        assert_eq!(&buf[..n], &data[10..10 + n]);
        assert_eq!(remote.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn read_past_eof_is_zero_without_connecting() {
        let (handle, remote) = handle_over(vec![1, 2, 3], 64);
        let mut buf = [0u8; 8];
        assert_eq!(handle.read_at(&mut buf, 100).unwrap(), 0);
        assert_eq!(remote.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn arbitrary_window_matches_source() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i ^ 0x5a) as u8).collect();
        let (handle, _) = handle_over(data.clone(), 7777);
        for &(offset, len) in &[(0u64, 10usize), (299_990, 100), (123_456, 4096)] {
            let got = read_fully(&handle, offset, len);
            let end = (offset as usize + len).min(data.len());
            assert_eq!(got, &data[offset as usize..end], "window {offset}+{len}");
        }
    }
}
