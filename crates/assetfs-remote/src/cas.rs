//! Remote content-addressable store client.

use std::io::{self, Read};
use std::sync::Arc;

use assetfs_cas::{
    BatchReadOutcome, BatchUpdateOutcome, BlobChecker, BlobData, BlobReader, BlobSink, BlobStream,
    BlobWriter, CancelToken, Error, ReadBlobResponse, Result,
};
use assetfs_integrity::{Algorithm, Digest};
use tracing::debug;

use crate::transport::{ByteStreamTransport, CasTransport, ChunkStream};
use crate::wire::{
    blob_resource_name, BatchReadBlobsRequest, FindMissingBlobsRequest, ReadRequest, WireDigest,
};

/// Client for a remote CAS. Small blobs go through the batched unary
/// calls; large blobs are streamed. Writes are not implemented in this
/// revision: the remote asset service is what populates the remote CAS.
pub struct RemoteCas {
    transport: Arc<dyn CasTransport>,
    byte_stream: Arc<dyn ByteStreamTransport>,
}

impl RemoteCas {
    pub fn new(
        transport: Arc<dyn CasTransport>,
        byte_stream: Arc<dyn ByteStreamTransport>,
    ) -> RemoteCas {
        RemoteCas {
            transport,
            byte_stream,
        }
    }
}

impl BlobChecker for RemoteCas {
    fn find_missing_blobs(
        &self,
        cancel: &CancelToken,
        digests: &[Digest],
        digest_function: Algorithm,
    ) -> Result<Vec<Digest>> {
        cancel.check()?;
        let request = FindMissingBlobsRequest {
            blob_digests: digests
                .iter()
                .map(|d| WireDigest::from_digest(d, digest_function))
                .collect(),
            digest_function: digest_function.name(),
        };
        let response = self.transport.find_missing_blobs(cancel, request)?;
        response
            .missing_blob_digests
            .iter()
            .map(|wire| wire.to_digest(digest_function))
            .collect()
    }
}

impl BlobReader for RemoteCas {
    fn batch_read_blobs(
        &self,
        cancel: &CancelToken,
        digests: &[Digest],
        digest_function: Algorithm,
    ) -> Result<BatchReadOutcome> {
        cancel.check()?;
        let request = BatchReadBlobsRequest {
            digests: digests
                .iter()
                .map(|d| WireDigest::from_digest(d, digest_function))
                .collect(),
            digest_function: digest_function.name(),
        };
        let response = self.transport.batch_read_blobs(cancel, request)?;
        let mut responses = Vec::with_capacity(response.responses.len());
        for entry in response.responses {
            responses.push(ReadBlobResponse {
                digest: entry.digest.to_digest(digest_function)?,
                data: if entry.status.is_ok() {
                    Some(entry.data)
                } else {
                    None
                },
                status: entry.status,
            });
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
        let request = ReadRequest {
            resource_name: blob_resource_name(digest, digest_function),
            read_offset: offset as i64,
            read_limit: limit as i64,
        };
        debug!(
            resource = %request.resource_name,
            offset,
            limit,
            "opening byte-stream read"
        );
        let stream = self.byte_stream.read(cancel, request)?;
        Ok(Box::new(ByteStreamReader::new(stream)))
    }
}

impl BlobWriter for RemoteCas {
    fn batch_update_blobs(
        &self,
        _cancel: &CancelToken,
        _blobs: &[BlobData],
        _digest_function: Algorithm,
    ) -> Result<BatchUpdateOutcome> {
        // The remote CAS is populated through the remote asset service;
        // direct writes are not on any code path yet.
        Err(Error::Unsupported("remote CAS batch_update_blobs"))
    }

    fn write_stream(
        &self,
        _cancel: &CancelToken,
        _digest: &Digest,
        _digest_function: Algorithm,
    ) -> Result<Box<dyn BlobSink>> {
        Err(Error::Unsupported("remote CAS write_stream"))
    }
}

/// Adapts a chunked server stream to `Read`.
///
/// Chunks can be larger than the consumer's buffer, so overflow bytes
/// from the last chunk are buffered. End of stream is surfaced exactly
/// once, after the internal buffer drains. Dropping the reader drops the
/// stream, which cancels the outstanding call.
pub struct ByteStreamReader {
    stream: Box<dyn ChunkStream>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl ByteStreamReader {
    pub fn new(stream: Box<dyn ChunkStream>) -> ByteStreamReader {
        ByteStreamReader {
            stream,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl Read for ByteStreamReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.buffered() > 0 {
                let n = self.buffered().min(out.len());
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                if self.pos == self.buf.len() {
                    self.buf.clear();
                    self.pos = 0;
                }
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.stream.recv() {
                Ok(Some(chunk)) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Ok(None) => self.eof = true,
                Err(e) => return Err(io::Error::other(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeChunkStream {
        chunks: VecDeque<Vec<u8>>,
        dropped: Arc<AtomicBool>,
    }

    impl ChunkStream for FakeChunkStream {
        fn recv(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.chunks.pop_front())
        }
    }

    impl Drop for FakeChunkStream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn reader_over(chunks: Vec<Vec<u8>>) -> (ByteStreamReader, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let stream = FakeChunkStream {
            chunks: chunks.into(),
            dropped: Arc::clone(&dropped),
        };
        (ByteStreamReader::new(Box::new(stream)), dropped)
    }

    #[test]
    fn small_reads_over_large_chunks() {
        let (mut reader, _) = reader_over(vec![b"abcdefgh".to_vec(), b"ij".to_vec()]);
        let mut buf = [0u8; 3];

        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"def");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"gh");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ij");
        // EOF exactly once after the buffer drained, and it stays EOF.
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn large_read_over_small_chunks() {
        let (mut reader, _) = reader_over(vec![b"ab".to_vec(), b"cd".to_vec()]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn empty_stream_is_immediate_eof() {
        let (mut reader, _) = reader_over(vec![]);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn dropping_reader_cancels_stream() {
        let (reader, dropped) = reader_over(vec![b"pending".to_vec()]);
        assert!(!dropped.load(Ordering::SeqCst));
        drop(reader);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
