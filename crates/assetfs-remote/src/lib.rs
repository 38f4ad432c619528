//! # assetfs-remote
//!
//! Clients for the two remote services assetfs can talk to:
//!
//! - a remote content-addressable store (find-missing / batch-read /
//!   byte-stream reads), and
//! - a remote asset resolver that maps `(URIs, integrity)` to a CAS
//!   digest, causing the remote CAS to populate itself from upstream.
//!
//! The RPC wire encoding is deliberately not part of this crate. The
//! clients are written against the transport traits in [`transport`],
//! whose request/response types mirror the generated-stub surface
//! (lowercase-hex digests, qualifier lists, chunked byte-stream reads).
//! Production deployments plug a gRPC-backed transport in behind that
//! seam; tests use in-memory transports.

pub mod asset;
pub mod cas;
pub mod transport;
pub mod wire;

pub use asset::{AssetFetcher, FetchResult, RemoteAssetClient};
pub use cas::RemoteCas;
pub use transport::{
    ByteStreamTransport, CasTransport, ChunkStream, CredentialHelper, FetchTransport,
    StaticCredentials,
};
