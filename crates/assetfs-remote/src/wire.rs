//! Request and response shapes of the remote services, as the generated
//! stubs expose them: digests travel as lowercase hex plus size,
//! qualifiers as name/value pairs.

use std::time::{Duration, SystemTime};

use assetfs_cas::Status;
use assetfs_integrity::{Algorithm, Digest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDigest {
    pub hash: String,
    pub size_bytes: i64,
}

impl WireDigest {
    pub fn from_digest(digest: &Digest, digest_function: Algorithm) -> WireDigest {
        WireDigest {
            hash: digest.hex(digest_function),
            size_bytes: digest.size_bytes,
        }
    }

    pub fn to_digest(&self, digest_function: Algorithm) -> assetfs_cas::Result<Digest> {
        Ok(Digest::from_hex(&self.hash, self.size_bytes, digest_function)?)
    }
}

#[derive(Debug, Clone)]
pub struct FindMissingBlobsRequest {
    pub blob_digests: Vec<WireDigest>,
    pub digest_function: &'static str,
}

#[derive(Debug, Clone)]
pub struct FindMissingBlobsResponse {
    pub missing_blob_digests: Vec<WireDigest>,
}

#[derive(Debug, Clone)]
pub struct BatchReadBlobsRequest {
    pub digests: Vec<WireDigest>,
    pub digest_function: &'static str,
}

#[derive(Debug, Clone)]
pub struct BatchReadBlobEntry {
    pub digest: WireDigest,
    pub data: Vec<u8>,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct BatchReadBlobsResponse {
    pub responses: Vec<BatchReadBlobEntry>,
}

#[derive(Debug, Clone)]
pub struct BatchUpdateBlobEntry {
    pub digest: WireDigest,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BatchUpdateBlobsRequest {
    pub requests: Vec<BatchUpdateBlobEntry>,
    pub digest_function: &'static str,
}

#[derive(Debug, Clone)]
pub struct BatchUpdateResultEntry {
    pub digest: WireDigest,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct BatchUpdateBlobsResponse {
    pub responses: Vec<BatchUpdateResultEntry>,
}

/// A byte-stream read. Resource names take the form
/// `blobs/<hex>/<size>`; a zero `read_limit` means until EOF.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub resource_name: String,
    pub read_offset: i64,
    pub read_limit: i64,
}

pub fn blob_resource_name(digest: &Digest, digest_function: Algorithm) -> String {
    format!("blobs/{}/{}", digest.hex(digest_function), digest.size_bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualifier {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct FetchBlobRequest {
    pub uris: Vec<String>,
    pub qualifiers: Vec<Qualifier>,
    pub digest_function: &'static str,
    /// No client-imposed deadline when absent.
    pub timeout: Option<Duration>,
    /// Minimum acceptable freshness of cached upstream content.
    pub oldest_content_accepted: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct FetchBlobResponse {
    pub status: Status,
    pub uri: String,
    pub qualifiers: Vec<Qualifier>,
    pub expires_at: Option<SystemTime>,
    pub blob_digest: WireDigest,
    pub digest_function: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_are_blobs_hex_size() {
        let digest = Algorithm::Sha256.digest_of_bytes(b"hello world\n");
        let name = blob_resource_name(&digest, Algorithm::Sha256);
        assert_eq!(
            name,
            format!("blobs/{}/12", digest.hex(Algorithm::Sha256))
        );
    }

    #[test]
    fn wire_digest_round_trips() {
        let digest = Algorithm::Blake3.digest_of_bytes(b"content");
        let wire = WireDigest::from_digest(&digest, Algorithm::Blake3);
        assert_eq!(wire.size_bytes, 7);
        let back = wire.to_digest(Algorithm::Blake3).unwrap();
        assert!(back.equals(&digest, Algorithm::Blake3));

        // Hex of the wrong width is rejected.
        let bad = WireDigest {
            hash: "abcd".to_string(),
            size_bytes: 1,
        };
        assert!(bad.to_digest(Algorithm::Blake3).is_err());
    }
}
