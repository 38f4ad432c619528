//! Transport seams for the remote services.
//!
//! Everything network-shaped sits behind these traits so the clients can
//! be exercised with in-memory implementations, and so the wire layer
//! (generated RPC stubs) stays out of the data plane.

use assetfs_cas::{CancelToken, Result};

use crate::wire::{
    BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, FetchBlobRequest, FetchBlobResponse, FindMissingBlobsRequest,
    FindMissingBlobsResponse, ReadRequest,
};

/// Unary operations of the remote content-addressable store.
pub trait CasTransport: Send + Sync {
    fn find_missing_blobs(
        &self,
        cancel: &CancelToken,
        request: FindMissingBlobsRequest,
    ) -> Result<FindMissingBlobsResponse>;

    fn batch_read_blobs(
        &self,
        cancel: &CancelToken,
        request: BatchReadBlobsRequest,
    ) -> Result<BatchReadBlobsResponse>;

    fn batch_update_blobs(
        &self,
        cancel: &CancelToken,
        request: BatchUpdateBlobsRequest,
    ) -> Result<BatchUpdateBlobsResponse>;
}

/// Server-streamed byte reads.
pub trait ByteStreamTransport: Send + Sync {
    fn read(&self, cancel: &CancelToken, request: ReadRequest) -> Result<Box<dyn ChunkStream>>;
}

/// One server-side stream of data chunks. `recv` returns `None` on clean
/// end of stream. Dropping the stream must cancel the outstanding call
/// so the server-side stream is released.
pub trait ChunkStream: Send {
    fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// The remote asset resolver's single operation.
pub trait FetchTransport: Send + Sync {
    fn fetch_blob(
        &self,
        cancel: &CancelToken,
        request: FetchBlobRequest,
    ) -> Result<FetchBlobResponse>;
}

/// Source of per-URI request headers, typically backed by a credential
/// helper process. The subprocess protocol itself is a consumer concern;
/// the client only needs headers per URI. Multi-valued headers are
/// allowed and joined by `,` when propagated as qualifiers.
pub trait CredentialHelper: Send + Sync {
    fn headers_for(&self, uri: &str) -> Result<Vec<(String, Vec<String>)>>;
}

/// A credential helper returning the same fixed headers for every URI.
pub struct StaticCredentials {
    headers: Vec<(String, Vec<String>)>,
}

impl StaticCredentials {
    pub fn new(headers: Vec<(String, Vec<String>)>) -> StaticCredentials {
        StaticCredentials { headers }
    }
}

impl CredentialHelper for StaticCredentials {
    fn headers_for(&self, _uri: &str) -> Result<Vec<(String, Vec<String>)>> {
        Ok(self.headers.clone())
    }
}
