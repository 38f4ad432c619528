//! # assetfs-fetch
//!
//! Direct HTTP downloader. The local counterpart of the remote asset
//! service: it fetches an asset's URIs itself, validates every declared
//! checksum while the body streams through, and imports the validated
//! bytes into the local CAS. It never touches the remote CAS or the
//! remote asset API.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use assetfs_cas::{Asset, CancelToken, Error, ImportSource, LocalCas, Result, Status};
use assetfs_integrity::{Algorithm, Checksum, Digest, Hasher, Integrity};
use assetfs_remote::{AssetFetcher, FetchResult};
use tracing::{debug, info, warn};

/// Bodies up to this size (when the server advertises a content length)
/// are staged in memory; anything larger or of unknown length goes
/// through a temporary file. Caps head-of-line memory usage at 64 MiB.
const MAX_IN_MEMORY_DOWNLOAD: u64 = 1 << 26;

pub struct Downloader {
    local_cas: Arc<dyn LocalCas>,
    client: reqwest::blocking::Client,
}

impl Downloader {
    pub fn new(local_cas: Arc<dyn LocalCas>) -> Downloader {
        Downloader {
            local_cas,
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn with_client(local_cas: Arc<dyn LocalCas>, client: reqwest::blocking::Client) -> Downloader {
        Downloader { local_cas, client }
    }

    fn download_from_uri(
        &self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
        uri: &str,
        headers: &[(String, String)],
        expected: &Integrity,
        digest_function: Algorithm,
    ) -> Result<Digest> {
        if expected.is_empty() {
            return Err(Error::MissingChecksum);
        }
        cancel.check()?;

        let mut request = self.client.get(uri);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let mut response = request
            .send()
            .map_err(|e| Error::Transport(format!("GET {uri}: {e}")))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::Transport(format!(
                "GET {uri}: unexpected status code {}",
                response.status().as_u16()
            )));
        }
        let content_length = response.content_length();

        // Stage the body in memory when it is known to be small, else in
        // a temporary file, while hashing under every declared algorithm
        // and, if missing, the primary one.
        let mut staging = Staging::new(content_length)?;
        let mut hashers: Vec<(Algorithm, Box<dyn Hasher>)> = expected
            .items()
            .map(|c| (c.algorithm, c.algorithm.hasher()))
            .collect();
        let primary_declared = expected.checksum_for(digest_function).is_some();
        if !primary_declared {
            warn!(
                uri,
                algorithm = digest_function.name(),
                "no declared checksum for the primary algorithm, computing it"
            );
            hashers.push((digest_function, digest_function.hasher()));
        }

        let mut buf = [0u8; 64 * 1024];
        let mut total: i64 = 0;
        loop {
            cancel.check()?;
            let n = response
                .read(&mut buf)
                .map_err(|e| Error::Transport(format!("GET {uri}: {e}")))?;
            if n == 0 {
                break;
            }
            staging.write_all(&buf[..n])?;
            for (_, hasher) in hashers.iter_mut() {
                hasher.update(&buf[..n]);
            }
            total += n as i64;
        }

        if let Some(advertised) = content_length {
            if total != advertised as i64 {
                return Err(Error::Transport(format!(
                    "GET {uri}: expected {advertised} bytes per content-length, got {total}"
                )));
            }
        }

        // Compare every hash against its declared checksum; the primary
        // hash also yields the digest.
        let mut known_digest = Digest::uninit();
        for (algorithm, hasher) in hashers {
            let got = Checksum {
                algorithm,
                hash: hasher.finalize(),
            };
            match expected.checksum_for(algorithm) {
                Some(declared) if !declared.equals(&got) => {
                    return Err(Error::ChecksumMismatch {
                        algorithm: algorithm.name(),
                        expected: declared.hex(),
                        actual: got.hex(),
                    });
                }
                Some(_) => {}
                None => {
                    info!(uri, sri = %got.to_sri(), "learned checksum");
                }
            }
            if algorithm == digest_function {
                known_digest = Digest::new(&got.hash, total, digest_function)?;
            }
        }

        let (source, spill_file) = staging.into_import_source()?;
        let imported = self
            .local_cas
            .import_blob(cancel, expected, Some(known_digest), digest_function, source);
        if let Some(path) = spill_file {
            let _ = std::fs::remove_file(&path);
        }
        imported
    }
}

impl AssetFetcher for Downloader {
    /// Iterates the asset's URIs in order until one downloads and
    /// validates; returns an aggregate error when every URI failed.
    fn fetch_blob(
        &self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
        _oldest_content_accepted: Option<SystemTime>,
        asset: &Asset,
        digest_function: Algorithm,
    ) -> Result<FetchResult> {
        debug!(uris = ?asset.uris, "downloading asset directly");
        let (shared, per_uri) = headers_from_qualifiers(&asset.qualifiers, asset.uris.len())?;

        let mut issues: Vec<String> = Vec::new();
        for (i, uri) in asset.uris.iter().enumerate() {
            let mut headers = shared.clone();
            headers.extend(per_uri[i].iter().cloned());
            match self.download_from_uri(cancel, timeout, uri, &headers, &asset.integrity, digest_function)
            {
                Ok(digest) => {
                    debug!(
                        uri,
                        digest = %digest.hex(digest_function),
                        size = digest.size_bytes,
                        "downloaded asset"
                    );
                    return Ok(FetchResult {
                        status: Status::ok(),
                        uri: uri.clone(),
                        qualifiers: asset.qualifiers.clone(),
                        expires_at: None,
                        blob_digest: digest,
                        digest_function,
                    });
                }
                // Integrity failures are never retried on a mirror: all
                // URIs must serve identical bytes, and cancellation is
                // terminal.
                Err(e @ Error::ChecksumMismatch { .. }) => return Err(e),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => issues.push(format!("{uri}: {e}")),
            }
        }
        Err(Error::Transport(format!(
            "unable to download asset from any uri:\n  {}",
            issues.join("\n  ")
        )))
    }
}

/// Splits `http_header:<name>` (all URIs) and
/// `http_header_uri:<index>:<name>` (one URI) qualifiers into request
/// headers. Unknown qualifier names are a configuration error.
fn headers_from_qualifiers(
    qualifiers: &BTreeMap<String, String>,
    uri_count: usize,
) -> Result<(Vec<(String, String)>, Vec<Vec<(String, String)>>)> {
    let mut shared = Vec::new();
    let mut per_uri = vec![Vec::new(); uri_count];
    for (key, value) in qualifiers {
        if let Some(name) = key.strip_prefix("http_header:") {
            shared.push((name.to_string(), value.clone()));
        } else if let Some(rest) = key.strip_prefix("http_header_uri:") {
            let (index, name) = rest
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("invalid http_header_uri qualifier {key:?}")))?;
            let index: usize = index
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid http_header_uri qualifier {key:?}")))?;
            if index >= uri_count {
                return Err(Error::Protocol(format!(
                    "http_header_uri index {index} out of range for {uri_count} uris"
                )));
            }
            per_uri[index].push((name.to_string(), value.clone()));
        } else {
            return Err(Error::Protocol(format!("unknown qualifier name {key:?}")));
        }
    }
    Ok((shared, per_uri))
}

/// Download staging area: an in-memory buffer for small bodies, a
/// temporary file otherwise. The file variant lets the CAS import
/// hardlink instead of copying when both are on the same volume.
enum Staging {
    Memory(Vec<u8>),
    File(tempfile::NamedTempFile),
}

impl Staging {
    fn new(content_length: Option<u64>) -> Result<Staging> {
        match content_length {
            Some(n) if n <= MAX_IN_MEMORY_DOWNLOAD => Ok(Staging::Memory(Vec::with_capacity(n as usize))),
            _ => Ok(Staging::File(tempfile::NamedTempFile::new()?)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Staging::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Staging::File(file) => Ok(file.write_all(data)?),
        }
    }

    /// The second element is the spill file to remove once the import is
    /// done; the CAS will have hardlinked or copied it by then.
    fn into_import_source(self) -> Result<(ImportSource, Option<std::path::PathBuf>)> {
        match self {
            Staging::Memory(buf) => Ok((
                ImportSource::Reader(Box::new(std::io::Cursor::new(buf))),
                None,
            )),
            Staging::File(file) => {
                let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
                Ok((ImportSource::File(path.clone()), Some(path)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qualifiers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn shared_and_per_uri_headers_split() {
        let q = qualifiers(&[
            ("http_header:Accept", "application/octet-stream"),
            ("http_header_uri:1:Authorization", "Bearer t"),
        ]);
        let (shared, per_uri) = headers_from_qualifiers(&q, 2).unwrap();
        assert_eq!(shared, vec![("Accept".to_string(), "application/octet-stream".to_string())]);
        assert!(per_uri[0].is_empty());
        assert_eq!(
            per_uri[1],
            vec![("Authorization".to_string(), "Bearer t".to_string())]
        );
    }

    #[test]
    fn unknown_and_malformed_qualifiers_are_rejected() {
        assert!(headers_from_qualifiers(&qualifiers(&[("frobnicate", "x")]), 1).is_err());
        assert!(headers_from_qualifiers(&qualifiers(&[("http_header_uri:nope", "x")]), 1).is_err());
        assert!(
            headers_from_qualifiers(&qualifiers(&[("http_header_uri:9:Auth", "x")]), 1).is_err()
        );
    }
}
