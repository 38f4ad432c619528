//! # assetfs-integrity
//!
//! Digest and integrity model for assetfs.
//!
//! Assets declare their expected content with Subresource Integrity (SRI)
//! strings, possibly one per hash algorithm. Content-addressed storage
//! identifies blobs by a [`Digest`]: the hash under the process-wide
//! *primary* algorithm plus the content size in bytes.
//!
//! The supported algorithm set is closed: SHA-256, SHA-384, SHA-512 and
//! BLAKE3.

pub mod cache;

pub use cache::ChecksumCache;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::Digest as _;
use thiserror::Error;

/// Largest hash size of any supported algorithm (SHA-512).
pub const MAX_HASH_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("malformed SRI string {0:?}")]
    MalformedSri(String),

    #[error("unknown digest algorithm {0:?}")]
    UnknownAlgorithm(String),

    #[error("unexpected {algorithm} hash size: got {got} bytes, want {want}")]
    HashLength {
        algorithm: &'static str,
        got: usize,
        want: usize,
    },

    #[error("duplicate {0} checksum in integrity set")]
    DuplicateAlgorithm(&'static str),

    #[error("failed to decode hex digest {digest:?}")]
    MalformedHex { digest: String },
}

/// A supported digest algorithm.
///
/// The derive order defines the iteration order of [`Integrity::items`]
/// and of checksum-cache probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
    Blake3,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Sha256,
        Algorithm::Sha384,
        Algorithm::Sha512,
        Algorithm::Blake3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
            Algorithm::Blake3 => "blake3",
        }
    }

    pub fn from_name(name: &str) -> Option<Algorithm> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(Algorithm::Sha256),
            "sha384" => Some(Algorithm::Sha384),
            "sha512" => Some(Algorithm::Sha512),
            "blake3" => Some(Algorithm::Blake3),
            _ => None,
        }
    }

    /// Hash output size in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Algorithm::Sha256 | Algorithm::Blake3 => 32,
            Algorithm::Sha384 => 48,
            Algorithm::Sha512 => 64,
        }
    }

    /// Stable one-byte identifier, used as part of checksum-cache keys.
    pub fn identifier(self) -> u8 {
        match self {
            Algorithm::Sha256 => 1,
            Algorithm::Sha384 => 2,
            Algorithm::Sha512 => 3,
            Algorithm::Blake3 => 4,
        }
    }

    /// The well-known digest of empty input under this algorithm.
    pub fn empty_hash(self) -> &'static [u8] {
        match self {
            Algorithm::Sha256 => &EMPTY_SHA256,
            Algorithm::Sha384 => &EMPTY_SHA384,
            Algorithm::Sha512 => &EMPTY_SHA512,
            Algorithm::Blake3 => &EMPTY_BLAKE3,
        }
    }

    /// A fresh streaming hasher for this algorithm.
    pub fn hasher(self) -> Box<dyn Hasher> {
        match self {
            Algorithm::Sha256 => Box::new(Sha2Hasher(sha2::Sha256::new())),
            Algorithm::Sha384 => Box::new(Sha2Hasher(sha2::Sha384::new())),
            Algorithm::Sha512 => Box::new(Sha2Hasher(sha2::Sha512::new())),
            Algorithm::Blake3 => Box::new(Blake3Hasher(blake3::Hasher::new())),
        }
    }

    /// Hash an in-memory buffer into a full digest.
    pub fn digest_of_bytes(self, data: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(data);
        let hash = hasher.finalize();
        Digest::new(&hash, data.len() as i64, self)
            .expect("hasher output length matches algorithm")
    }

    /// Hash a reader to exhaustion into a full digest.
    pub fn digest_of_reader<R: Read>(self, mut reader: R) -> io::Result<Digest> {
        let mut hasher = self.hasher();
        let mut buf = [0u8; 64 * 1024];
        let mut total: i64 = 0;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as i64;
        }
        let hash = hasher.finalize();
        Ok(Digest::new(&hash, total, self).expect("hasher output length matches algorithm"))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Minimal streaming hasher interface, object safe so callers can hash
/// under several algorithms at once without knowing the concrete types.
pub trait Hasher: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

struct Sha2Hasher<D: sha2::Digest + Send>(D);

impl<D: sha2::Digest + Send> Hasher for Sha2Hasher<D> {
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

struct Blake3Hasher(blake3::Hasher);

impl Hasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().as_bytes().to_vec()
    }
}

/// The digest of a blob in content-addressable storage: hash under an
/// implicit algorithm, plus the content size in bytes.
///
/// The hash is stored inline at the maximum supported width; bytes past
/// the algorithm's output size are unspecified and must be ignored. All
/// public methods take the algorithm explicitly and only consider the
/// meaningful prefix.
#[derive(Clone, Copy)]
pub struct Digest {
    hash: [u8; MAX_HASH_SIZE],
    pub size_bytes: i64,
}

impl Digest {
    /// An uninitialized digest. Compares unequal to everything, including
    /// other uninitialized digests.
    pub fn uninit() -> Digest {
        Digest {
            hash: [0u8; MAX_HASH_SIZE],
            size_bytes: 0,
        }
    }

    pub fn new(hash: &[u8], size_bytes: i64, algorithm: Algorithm) -> Result<Digest, IntegrityError> {
        if hash.len() != algorithm.size_bytes() {
            return Err(IntegrityError::HashLength {
                algorithm: algorithm.name(),
                got: hash.len(),
                want: algorithm.size_bytes(),
            });
        }
        let mut out = Digest {
            hash: [0u8; MAX_HASH_SIZE],
            size_bytes,
        };
        out.hash[..hash.len()].copy_from_slice(hash);
        Ok(out)
    }

    /// Parse a lowercase hex digest, as used on the remote-execution wire.
    pub fn from_hex(
        hex_digest: &str,
        size_bytes: i64,
        algorithm: Algorithm,
    ) -> Result<Digest, IntegrityError> {
        let hash = hex::decode(hex_digest).map_err(|_| IntegrityError::MalformedHex {
            digest: hex_digest.to_string(),
        })?;
        Digest::new(&hash, size_bytes, algorithm)
    }

    /// Value equality under the given algorithm.
    ///
    /// Uninitialized digests are never equal to anything; this avoids
    /// silently aliasing two unknown digests.
    pub fn equals(&self, other: &Digest, algorithm: Algorithm) -> bool {
        if self.uninitialized() || other.uninitialized() {
            return false;
        }
        if self.size_bytes != other.size_bytes {
            return false;
        }
        let n = algorithm.size_bytes();
        self.hash[..n] == other.hash[..n]
    }

    pub fn uninitialized(&self) -> bool {
        self.size_bytes == 0 && self.hash == [0u8; MAX_HASH_SIZE]
    }

    /// True if this digest is the well-known digest of empty content.
    pub fn is_zero_sized(&self, algorithm: Algorithm) -> bool {
        if self.size_bytes != 0 {
            return false;
        }
        let n = algorithm.size_bytes();
        self.hash[..n] == *algorithm.empty_hash()
    }

    pub fn hash_bytes(&self, algorithm: Algorithm) -> &[u8] {
        &self.hash[..algorithm.size_bytes()]
    }

    pub fn hex(&self, algorithm: Algorithm) -> String {
        hex::encode(self.hash_bytes(algorithm))
    }

    pub fn copy_hash_into(
        &self,
        dest: &mut [u8],
        algorithm: Algorithm,
    ) -> Result<(), IntegrityError> {
        let n = algorithm.size_bytes();
        if dest.len() < n {
            return Err(IntegrityError::HashLength {
                algorithm: algorithm.name(),
                got: dest.len(),
                want: n,
            });
        }
        dest[..n].copy_from_slice(&self.hash[..n]);
        Ok(())
    }

    pub fn checksum(&self, algorithm: Algorithm) -> Checksum {
        Checksum {
            algorithm,
            hash: self.hash_bytes(algorithm).to_vec(),
        }
    }
}

impl Default for Digest {
    fn default() -> Self {
        Digest::uninit()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.uninitialized() {
            return f.write_str("Digest(uninitialized)");
        }
        write!(
            f,
            "Digest({}…, {} bytes)",
            hex::encode(&self.hash[..8]),
            self.size_bytes
        )
    }
}

/// A single checksum of an artifact under a specific algorithm. Carries
/// no size information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: Algorithm,
    pub hash: Vec<u8>,
}

impl Checksum {
    /// Parse an SRI string of the form `<algorithm>-<base64(hash)>`.
    pub fn from_sri(sri: &str) -> Result<Checksum, IntegrityError> {
        let (name, payload) = sri
            .split_once('-')
            .ok_or_else(|| IntegrityError::MalformedSri(sri.to_string()))?;
        let algorithm =
            Algorithm::from_name(name).ok_or_else(|| IntegrityError::UnknownAlgorithm(name.to_string()))?;
        let hash = BASE64
            .decode(payload)
            .map_err(|_| IntegrityError::MalformedSri(sri.to_string()))?;
        if hash.len() != algorithm.size_bytes() {
            return Err(IntegrityError::HashLength {
                algorithm: algorithm.name(),
                got: hash.len(),
                want: algorithm.size_bytes(),
            });
        }
        Ok(Checksum { algorithm, hash })
    }

    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algorithm.name(), BASE64.encode(&self.hash))
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.hash)
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }

    /// True if this checksum is the well-known checksum of empty content.
    pub fn is_zero_sized(&self) -> bool {
        self.hash == self.algorithm.empty_hash()
    }

    pub fn equals(&self, other: &Checksum) -> bool {
        self.algorithm == other.algorithm
            && !self.hash.is_empty()
            && !other.hash.is_empty()
            && self.hash == other.hash
    }
}

/// The integrity of an artifact: up to one checksum per algorithm, all
/// referring to the same content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Integrity {
    entries: BTreeMap<Algorithm, Vec<u8>>,
}

impl Integrity {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build from SRI strings; at most one per algorithm.
    pub fn from_sris<I, S>(sris: I) -> Result<Integrity, IntegrityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Integrity::default();
        for sri in sris {
            let checksum = Checksum::from_sri(sri.as_ref())?;
            if out.entries.contains_key(&checksum.algorithm) {
                return Err(IntegrityError::DuplicateAlgorithm(checksum.algorithm.name()));
            }
            out.entries.insert(checksum.algorithm, checksum.hash);
        }
        Ok(out)
    }

    /// Build from checksums. Later entries for the same algorithm win.
    pub fn from_checksums<I: IntoIterator<Item = Checksum>>(checksums: I) -> Integrity {
        let mut out = Integrity::default();
        for c in checksums {
            out.entries.insert(c.algorithm, c.hash);
        }
        out
    }

    /// Checksums in algorithm order (sha256, sha384, sha512, blake3).
    pub fn items(&self) -> impl Iterator<Item = Checksum> + '_ {
        self.entries.iter().map(|(&algorithm, hash)| Checksum {
            algorithm,
            hash: hash.clone(),
        })
    }

    pub fn checksum_for(&self, algorithm: Algorithm) -> Option<Checksum> {
        self.entries.get(&algorithm).map(|hash| Checksum {
            algorithm,
            hash: hash.clone(),
        })
    }

    /// The best single checksum to convey this integrity with: the given
    /// primary algorithm if present, otherwise SHA-256 (most widely
    /// supported), BLAKE3 (fastest), SHA-512, SHA-384.
    pub fn best_single_checksum(&self, primary: Algorithm) -> Option<Checksum> {
        for algorithm in [
            primary,
            Algorithm::Sha256,
            Algorithm::Blake3,
            Algorithm::Sha512,
            Algorithm::Sha384,
        ] {
            if let Some(c) = self.checksum_for(algorithm) {
                return Some(c);
            }
        }
        None
    }

    /// True if the two sets agree: both non-empty, every algorithm
    /// present in both has equal hashes, and at least one algorithm is
    /// present in both. An algorithm missing on one side is not a
    /// mismatch by itself.
    pub fn equivalent(&self, other: &Integrity) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let mut matching = 0;
        for (algorithm, hash) in &self.entries {
            if let Some(other_hash) = other.entries.get(algorithm) {
                if hash != other_hash {
                    return false;
                }
                matching += 1;
            }
        }
        matching > 0
    }

    /// SRI strings for every checksum, in algorithm order. Used for log
    /// messages about learned associations.
    pub fn to_sri_list(&self) -> Vec<String> {
        self.items().map(|c| c.to_sri()).collect()
    }
}

// Empty-input digests, tabulated so zero-sized content can be recognized
// without hashing.

/// sha256("")
const EMPTY_SHA256: [u8; 32] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

/// sha384("")
const EMPTY_SHA384: [u8; 48] = [
    0x38, 0xb0, 0x60, 0xa7, 0x51, 0xac, 0x96, 0x38, 0x4c, 0xd9, 0x32, 0x7e, 0xb1, 0xb1, 0xe3, 0x6a,
    0x21, 0xfd, 0xb7, 0x11, 0x14, 0xbe, 0x07, 0x43, 0x4c, 0x0c, 0xc7, 0xbf, 0x63, 0xf6, 0xe1, 0xda,
    0x27, 0x4e, 0xde, 0xbf, 0xe7, 0x6f, 0x65, 0xfb, 0xd5, 0x1a, 0xd2, 0xf1, 0x48, 0x98, 0xb9, 0x5b,
];

/// sha512("")
const EMPTY_SHA512: [u8; 64] = [
    0xcf, 0x83, 0xe1, 0x35, 0x7e, 0xef, 0xb8, 0xbd, 0xf1, 0x54, 0x28, 0x50, 0xd6, 0x6d, 0x80, 0x07,
    0xd6, 0x20, 0xe4, 0x05, 0x0b, 0x57, 0x15, 0xdc, 0x83, 0xf4, 0xa9, 0x21, 0xd3, 0x6c, 0xe9, 0xce,
    0x47, 0xd0, 0xd1, 0x3c, 0x5d, 0x85, 0xf2, 0xb0, 0xff, 0x83, 0x18, 0xd2, 0x87, 0x7e, 0xec, 0x2f,
    0x63, 0xb9, 0x31, 0xbd, 0x47, 0x41, 0x7a, 0x81, 0xa5, 0x38, 0x32, 0x7a, 0xf9, 0x27, 0xda, 0x3e,
];

/// blake3("")
const EMPTY_BLAKE3: [u8; 32] = [
    0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc, 0xc9, 0x49,
    0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca, 0xe4, 0x1f, 0x32, 0x62,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum_of(algorithm: Algorithm, data: &[u8]) -> Checksum {
        algorithm.digest_of_bytes(data).checksum(algorithm)
    }

    // ========== Algorithm ==========

    #[test]
    fn algorithm_names_round_trip() {
        for algorithm in Algorithm::ALL {
            assert_eq!(Algorithm::from_name(algorithm.name()), Some(algorithm));
        }
        assert_eq!(Algorithm::from_name("SHA256"), Some(Algorithm::Sha256));
        assert_eq!(Algorithm::from_name("md5"), None);
    }

    #[test]
    fn empty_hash_constants_match_hashers() {
        for algorithm in Algorithm::ALL {
            let digest = algorithm.digest_of_bytes(b"");
            assert_eq!(
                digest.hash_bytes(algorithm),
                algorithm.empty_hash(),
                "empty-input constant for {algorithm}"
            );
            assert!(digest.is_zero_sized(algorithm));
        }
    }

    #[test]
    fn digest_of_reader_matches_digest_of_bytes() {
        let data = vec![0x5au8; 200_000];
        let from_bytes = Algorithm::Blake3.digest_of_bytes(&data);
        let from_reader = Algorithm::Blake3.digest_of_reader(&data[..]).unwrap();
        assert!(from_bytes.equals(&from_reader, Algorithm::Blake3));
        assert_eq!(from_reader.size_bytes, 200_000);
    }

    // ========== SRI ==========

    #[test]
    fn sri_round_trip_all_algorithms() {
        for algorithm in Algorithm::ALL {
            let checksum = checksum_of(algorithm, b"some bytes");
            let parsed = Checksum::from_sri(&checksum.to_sri()).unwrap();
            assert!(parsed.equals(&checksum));
        }
    }

    #[test]
    fn sri_rejects_malformed_input() {
        assert!(matches!(
            Checksum::from_sri("nodash"),
            Err(IntegrityError::MalformedSri(_))
        ));
        assert!(matches!(
            Checksum::from_sri("md5-abcd"),
            Err(IntegrityError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            Checksum::from_sri("sha256-!!!not base64!!!"),
            Err(IntegrityError::MalformedSri(_))
        ));
        // valid base64, wrong length for sha256
        assert!(matches!(
            Checksum::from_sri("sha256-AAAA"),
            Err(IntegrityError::HashLength { .. })
        ));
    }

    // ========== Digest ==========

    #[test]
    fn uninitialized_digests_never_compare_equal() {
        let a = Digest::uninit();
        let b = Digest::uninit();
        assert!(a.uninitialized());
        assert!(!a.equals(&b, Algorithm::Sha256));
        assert!(!a.equals(&a.clone(), Algorithm::Sha256));

        let real = Algorithm::Sha256.digest_of_bytes(b"x");
        assert!(!real.equals(&a, Algorithm::Sha256));
        assert!(real.equals(&real.clone(), Algorithm::Sha256));
    }

    #[test]
    fn digest_equality_respects_size() {
        let hash = Algorithm::Sha256.digest_of_bytes(b"x");
        let same_hash_other_size =
            Digest::new(hash.hash_bytes(Algorithm::Sha256), 99, Algorithm::Sha256).unwrap();
        assert!(!hash.equals(&same_hash_other_size, Algorithm::Sha256));
    }

    #[test]
    fn digest_hex_round_trip() {
        let digest = Algorithm::Sha512.digest_of_bytes(b"hello");
        let parsed =
            Digest::from_hex(&digest.hex(Algorithm::Sha512), digest.size_bytes, Algorithm::Sha512)
                .unwrap();
        assert!(digest.equals(&parsed, Algorithm::Sha512));
    }

    #[test]
    fn digest_rejects_wrong_hash_length() {
        assert!(Digest::new(&[0u8; 31], 0, Algorithm::Sha256).is_err());
        assert!(Digest::from_hex("abcd", 4, Algorithm::Sha256).is_err());
        assert!(Digest::from_hex("zz", 1, Algorithm::Sha256).is_err());
    }

    // ========== Integrity ==========

    #[test]
    fn integrity_rejects_duplicate_algorithm() {
        let a = checksum_of(Algorithm::Sha256, b"a").to_sri();
        let b = checksum_of(Algorithm::Sha256, b"b").to_sri();
        assert!(matches!(
            Integrity::from_sris([a.as_str(), b.as_str()]),
            Err(IntegrityError::DuplicateAlgorithm("sha256"))
        ));
    }

    #[test]
    fn items_iterate_in_algorithm_order() {
        let integrity = Integrity::from_checksums([
            checksum_of(Algorithm::Blake3, b"x"),
            checksum_of(Algorithm::Sha256, b"x"),
            checksum_of(Algorithm::Sha512, b"x"),
        ]);
        let order: Vec<Algorithm> = integrity.items().map(|c| c.algorithm).collect();
        assert_eq!(
            order,
            vec![Algorithm::Sha256, Algorithm::Sha512, Algorithm::Blake3]
        );
    }

    #[test]
    fn best_single_checksum_preference_order() {
        // Primary missing: sha256 wins over blake3 and sha384.
        let integrity = Integrity::from_checksums([
            checksum_of(Algorithm::Sha256, b"x"),
            checksum_of(Algorithm::Sha384, b"x"),
            checksum_of(Algorithm::Blake3, b"x"),
        ]);
        let best = integrity.best_single_checksum(Algorithm::Sha512).unwrap();
        assert_eq!(best.algorithm, Algorithm::Sha256);

        // Primary present: primary wins.
        let best = integrity.best_single_checksum(Algorithm::Blake3).unwrap();
        assert_eq!(best.algorithm, Algorithm::Blake3);

        // Only sha384 present.
        let only384 = Integrity::from_checksums([checksum_of(Algorithm::Sha384, b"x")]);
        let best = only384.best_single_checksum(Algorithm::Sha256).unwrap();
        assert_eq!(best.algorithm, Algorithm::Sha384);

        assert!(Integrity::default()
            .best_single_checksum(Algorithm::Sha256)
            .is_none());
    }

    #[test]
    fn equivalence_requires_overlap() {
        let sha = checksum_of(Algorithm::Sha256, b"x");
        let b3 = checksum_of(Algorithm::Blake3, b"x");

        let a = Integrity::from_checksums([sha.clone()]);
        let b = Integrity::from_checksums([b3.clone()]);
        // No algorithm in common: not equivalent.
        assert!(!a.equivalent(&b));

        let both = Integrity::from_checksums([sha.clone(), b3.clone()]);
        assert!(a.equivalent(&both));
        assert!(both.equivalent(&a));

        // Overlapping but disagreeing.
        let other = Integrity::from_checksums([checksum_of(Algorithm::Sha256, b"y"), b3]);
        assert!(!other.equivalent(&both));

        assert!(!Integrity::default().equivalent(&a));
        assert!(!a.equivalent(&Integrity::default()));
    }
}
