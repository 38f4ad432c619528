//! Remote asset resolver client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use assetfs_cas::{Asset, CancelToken, Error, Result, Status};
use assetfs_integrity::{Algorithm, Digest};
use tracing::warn;

use crate::transport::{CredentialHelper, FetchTransport};
use crate::wire::{FetchBlobRequest, Qualifier};

/// The resolved outcome of a fetch: which URI served it, the digest the
/// content now has in the remote CAS, and server-side metadata.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: Status,
    pub uri: String,
    pub qualifiers: BTreeMap<String, String>,
    pub expires_at: Option<SystemTime>,
    pub blob_digest: Digest,
    pub digest_function: Algorithm,
}

/// Anything that can resolve an asset to a digest while making the blob
/// available in the remote CAS. Implemented by [`RemoteAssetClient`] and
/// by the direct downloader (which "resolves" into the local CAS).
pub trait AssetFetcher: Send + Sync {
    fn fetch_blob(
        &self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
        oldest_content_accepted: Option<SystemTime>,
        asset: &Asset,
        digest_function: Algorithm,
    ) -> Result<FetchResult>;
}

pub struct RemoteAssetClient {
    transport: Arc<dyn FetchTransport>,
    credentials: Option<Arc<dyn CredentialHelper>>,
}

impl RemoteAssetClient {
    /// `credentials`, when given, is queried per URI and its headers are
    /// propagated to the server as qualifiers.
    pub fn new(
        transport: Arc<dyn FetchTransport>,
        credentials: Option<Arc<dyn CredentialHelper>>,
    ) -> RemoteAssetClient {
        RemoteAssetClient {
            transport,
            credentials,
        }
    }

    fn qualifiers_with_credentials(&self, asset: &Asset) -> BTreeMap<String, String> {
        let mut qualifiers = asset.qualifiers.clone();
        let Some(helper) = &self.credentials else {
            return qualifiers;
        };
        for (i, uri) in asset.uris.iter().enumerate() {
            let headers = match helper.headers_for(uri) {
                Ok(headers) => headers,
                Err(e) => {
                    warn!(uri = %uri, error = %e, "credential helper failed");
                    continue;
                }
            };
            for (name, values) in headers {
                // Bazel's convention for per-URL headers; RFC 9110 permits
                // merging repeated field values with a comma.
                qualifiers.insert(format!("http_header_url:{i}:{name}"), values.join(","));
            }
        }
        qualifiers
    }
}

impl AssetFetcher for RemoteAssetClient {
    fn fetch_blob(
        &self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
        oldest_content_accepted: Option<SystemTime>,
        asset: &Asset,
        digest_function: Algorithm,
    ) -> Result<FetchResult> {
        cancel.check()?;
        let request = build_fetch_request(
            timeout,
            oldest_content_accepted,
            asset,
            &self.qualifiers_with_credentials(asset),
            digest_function,
        )?;
        let response = self.transport.fetch_blob(cancel, request)?;

        let response_function = Algorithm::from_name(&response.digest_function)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "fetch response uses unknown digest function {:?}",
                    response.digest_function
                ))
            })?;
        let blob_digest = response.blob_digest.to_digest(response_function)?;

        // If the caller already knows a checksum for the primary
        // algorithm, the server's answer must agree with it.
        if let Some(known) = asset.integrity.checksum_for(digest_function) {
            let expected = Digest::new(&known.hash, blob_digest.size_bytes, digest_function)?;
            if !expected.equals(&blob_digest, digest_function) {
                return Err(Error::RemoteAssetIntegrity {
                    expected: expected.hex(digest_function),
                    actual: blob_digest.hex(digest_function),
                });
            }
        }

        Ok(FetchResult {
            status: response.status,
            uri: response.uri,
            qualifiers: response
                .qualifiers
                .into_iter()
                .map(|q| (q.name, q.value))
                .collect(),
            expires_at: response.expires_at,
            blob_digest,
            digest_function: response_function,
        })
    }
}

fn build_fetch_request(
    timeout: Option<Duration>,
    oldest_content_accepted: Option<SystemTime>,
    asset: &Asset,
    qualifiers: &BTreeMap<String, String>,
    digest_function: Algorithm,
) -> Result<FetchBlobRequest> {
    // Sending every known checksum was considered; in practice a single
    // `checksum.sri` for the preferred algorithm is what implementations
    // support, so the best single checksum is sent.
    let checksum = asset
        .integrity
        .best_single_checksum(digest_function)
        .ok_or(Error::MissingChecksum)?;

    let mut unique = qualifiers.clone();
    unique.insert("checksum.sri".to_string(), checksum.to_sri());

    Ok(FetchBlobRequest {
        uris: asset.uris.clone(),
        qualifiers: unique
            .into_iter()
            .map(|(name, value)| Qualifier { name, value })
            .collect(),
        digest_function: digest_function.name(),
        timeout,
        oldest_content_accepted,
    })
}
