//! Process-wide cache of learned checksum → digest associations.
//!
//! Manifest entries declare integrity (hashes without sizes); the CAS
//! works in digests (primary-algorithm hash plus size). Whenever a digest
//! is learned for an asset, it is recorded here under *every* hash the
//! asset declared, so any of them resolves to the same digest later.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{Algorithm, Checksum, Digest, Integrity, MAX_HASH_SIZE};

const SHARD_COUNT: usize = 256;
const SHARD_MASK: usize = SHARD_COUNT - 1;

/// Map key: the hash padded to the maximum width, its real length, and
/// the algorithm identifier byte. Storing the full hash (rather than a
/// derived 64-bit key) makes collisions impossible.
#[derive(PartialEq, Eq, Hash)]
struct Key {
    hash: [u8; MAX_HASH_SIZE],
    len: u8,
    identifier: u8,
}

impl Key {
    fn new(hash: &[u8], identifier: u8) -> Key {
        let mut padded = [0u8; MAX_HASH_SIZE];
        padded[..hash.len()].copy_from_slice(hash);
        Key {
            hash: padded,
            len: hash.len() as u8,
            identifier,
        }
    }
}

/// Sharded concurrent map from `(hash, algorithm)` to the digest under
/// the primary algorithm. Grow-only for the lifetime of the process;
/// writes are idempotent and last-writer-wins.
pub struct ChecksumCache {
    shards: Vec<RwLock<HashMap<Key, Digest>>>,
}

impl ChecksumCache {
    pub fn new() -> ChecksumCache {
        ChecksumCache {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, hash: &[u8]) -> &RwLock<HashMap<Key, Digest>> {
        &self.shards[hash[0] as usize & SHARD_MASK]
    }

    pub fn get(&self, hash: &[u8], identifier: u8) -> Option<Digest> {
        if hash.is_empty() || hash.len() > MAX_HASH_SIZE {
            return None;
        }
        self.shard(hash).read().get(&Key::new(hash, identifier)).copied()
    }

    pub fn put(&self, hash: &[u8], identifier: u8, digest: Digest) {
        if hash.is_empty() || hash.len() > MAX_HASH_SIZE {
            return;
        }
        self.shard(hash).write().insert(Key::new(hash, identifier), digest);
    }

    pub fn from_checksum(&self, checksum: &Checksum) -> Option<Digest> {
        self.get(&checksum.hash, checksum.algorithm.identifier())
    }

    /// First hit in algorithm iteration order.
    pub fn from_integrity(&self, integrity: &Integrity) -> Option<Digest> {
        integrity.items().find_map(|c| self.from_checksum(&c))
    }

    /// Record `digest` under every checksum present in `integrity`.
    pub fn put_integrity(&self, integrity: &Integrity, digest: Digest) {
        for checksum in integrity.items() {
            self.put(&checksum.hash, checksum.algorithm.identifier(), digest);
        }
    }

    /// Number of cached associations, across all shards. Intended for
    /// tests and diagnostics.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChecksumCache {
    fn default() -> Self {
        ChecksumCache::new()
    }
}
