//! Alternative renderings of one manifest.
//!
//! The default view serves every entry under its declared path. The
//! other views re-key the same assets so existing tools can consume the
//! mount directly:
//!
//! - `uri`: entries appear under `scheme/host/path` of each mirror URI;
//! - `repository_cache`: Bazel repository-cache layout,
//!   `content_addressable/<algorithm>/<hex>/file`;
//! - `bazel_disk_cache`: Bazel disk-cache layout under the primary
//!   algorithm, `cas/<hh>/<hex>`;
//! - `bazel_repo`: the default view plus synthetic `REPO.bazel` and
//!   `BUILD.bazel` files, making the mount loadable as a Bazel
//!   repository.

use std::collections::BTreeMap;

use assetfs_integrity::{Algorithm, Checksum, Integrity};

use crate::{Leaf, Manifest, ManifestError, ManifestTree, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    #[default]
    Default,
    Uri,
    RepositoryCache,
    BazelDiskCache,
    BazelRepo,
}

/// Synthetic BUILD file exposing every rendered file to Bazel.
const BAZEL_BUILD_FILE: &[u8] = b"# generated by assetfs\nexports_files(glob([\"**\"]))\n";
const BAZEL_REPO_FILE: &[u8] = b"";

impl View {
    pub fn from_name(name: &str) -> Option<View> {
        match name {
            "default" => Some(View::Default),
            "uri" => Some(View::Uri),
            "repository_cache" => Some(View::RepositoryCache),
            "bazel_disk_cache" => Some(View::BazelDiskCache),
            "bazel_repo" => Some(View::BazelRepo),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            View::Default => "default",
            View::Uri => "uri",
            View::RepositoryCache => "repository_cache",
            View::BazelDiskCache => "bazel_disk_cache",
            View::BazelRepo => "bazel_repo",
        }
    }

    /// Files this view fabricates on top of the manifest. Their content
    /// is known up front; the mount layer seeds the local CAS with it so
    /// reads never go to the network.
    pub fn fake_leaves(self) -> &'static [(&'static str, &'static [u8])] {
        match self {
            View::BazelRepo => &[
                ("REPO.bazel", BAZEL_REPO_FILE),
                ("BUILD.bazel", BAZEL_BUILD_FILE),
            ],
            _ => &[],
        }
    }

    /// Renders the manifest through this view.
    pub fn tree(self, manifest: &Manifest, digest_function: Algorithm) -> Result<ManifestTree> {
        let mut tree = match self {
            View::Default | View::BazelRepo => ManifestTree::from_manifest(manifest)?,
            View::Uri => uri_tree(manifest)?,
            View::RepositoryCache => {
                cas_tree(manifest, digest_function, false, |algorithm, hex| {
                    format!("content_addressable/{}/{hex}/file", algorithm.name())
                })?
            }
            View::BazelDiskCache => cas_tree(manifest, digest_function, true, |_, hex| {
                format!("cas/{}/{hex}", &hex[..2])
            })?,
        };

        for (name, content) in self.fake_leaves() {
            let digest = digest_function.digest_of_bytes(content);
            tree.insert(
                name,
                Leaf {
                    uris: Vec::new(),
                    integrity: Integrity::from_checksums([digest.checksum(digest_function)]),
                    size_hint: content.len() as i64,
                    executable: false,
                },
            )?;
        }
        Ok(tree)
    }
}

fn uri_tree(manifest: &Manifest) -> Result<ManifestTree> {
    let mut tree = ManifestTree::default();
    for entry in manifest.paths.values() {
        for uri in &entry.uris {
            let Some(path) = path_for_uri(uri) else {
                return Err(ManifestError::InvalidPath(uri.clone()));
            };
            let leaf = Leaf {
                uris: entry.uris.clone(),
                integrity: Integrity::from_sris(entry.integrity.sris())?,
                size_hint: entry.size.unwrap_or(-1),
                executable: entry.executable,
            };
            match tree.insert(&path, leaf) {
                Ok(()) => {}
                // Mirrors of different entries may render to the same
                // place; first one wins.
                Err(ManifestError::PathConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(tree)
}

/// `scheme/host/path`, stripped of query and fragment.
fn path_for_uri(uri: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once("://")?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(scheme.len() + rest.len() + 1);
    out.push_str(scheme);
    for segment in rest.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    Some(out)
}

fn cas_tree(
    manifest: &Manifest,
    digest_function: Algorithm,
    only_primary: bool,
    render: impl Fn(Algorithm, &str) -> String,
) -> Result<ManifestTree> {
    struct Grouped {
        uris: Vec<String>,
        size_hint: i64,
        executable: bool,
        checksum: Checksum,
    }

    // Group by checksum so mirrors of the same content collapse into
    // one rendered file carrying every URI.
    let mut grouped: BTreeMap<(Algorithm, Vec<u8>), Grouped> = BTreeMap::new();
    for entry in manifest.paths.values() {
        let integrity = Integrity::from_sris(entry.integrity.sris())?;
        for checksum in integrity.items() {
            if only_primary && checksum.algorithm != digest_function {
                continue;
            }
            let key = (checksum.algorithm, checksum.hash.clone());
            let slot = grouped.entry(key).or_insert_with(|| Grouped {
                uris: Vec::new(),
                size_hint: entry.size.unwrap_or(-1),
                executable: entry.executable,
                checksum,
            });
            for uri in &entry.uris {
                if !slot.uris.contains(uri) {
                    slot.uris.push(uri.clone());
                }
            }
        }
    }

    let mut tree = ManifestTree::default();
    for group in grouped.into_values() {
        let path = render(group.checksum.algorithm, &group.checksum.hex());
        let leaf = Leaf {
            uris: group.uris,
            integrity: Integrity::from_checksums([group.checksum]),
            size_hint: group.size_hint,
            executable: group.executable,
        };
        tree.insert(&path, leaf)?;
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;

    fn sri_of(data: &[u8]) -> String {
        Algorithm::Sha256
            .digest_of_bytes(data)
            .checksum(Algorithm::Sha256)
            .to_sri()
    }

    fn sample_manifest() -> Manifest {
        let sri = sri_of(b"shared");
        let other = sri_of(b"other");
        let json = format!(
            r#"{{"paths": {{
                "a/one": {{"uris": ["https://cdn.test/one?sig=x", "https://mirror.test/deep/one"], "integrity": "{sri}", "size": 6}},
                "b/two": {{"uris": ["https://cdn.test/two"], "integrity": "{other}", "size": 5, "executable": true}}
            }}}}"#
        );
        Manifest::parse(json.as_bytes()).unwrap()
    }

    #[test]
    fn view_names_round_trip() {
        for view in [
            View::Default,
            View::Uri,
            View::RepositoryCache,
            View::BazelDiskCache,
            View::BazelRepo,
        ] {
            assert_eq!(View::from_name(view.name()), Some(view));
        }
        assert_eq!(View::from_name("nix_store"), None);
    }

    #[test]
    fn uri_view_renders_scheme_host_path() {
        let tree = View::Uri
            .tree(&sample_manifest(), Algorithm::Sha256)
            .unwrap();
        // Query strings are dropped, both mirrors appear.
        assert!(tree.leaves.contains_key("https/cdn.test/one"));
        assert!(tree.leaves.contains_key("https/mirror.test/deep/one"));
        assert!(tree.leaves.contains_key("https/cdn.test/two"));
        // Each rendered leaf keeps all mirror URIs of its entry.
        assert_eq!(tree.leaves["https/mirror.test/deep/one"].uris.len(), 2);
    }

    #[test]
    fn bazel_disk_cache_view_uses_sharded_hex_paths() {
        let tree = View::BazelDiskCache
            .tree(&sample_manifest(), Algorithm::Sha256)
            .unwrap();
        let hex = Algorithm::Sha256
            .digest_of_bytes(b"shared")
            .hex(Algorithm::Sha256);
        let path = format!("cas/{}/{hex}", &hex[..2]);
        assert!(tree.leaves.contains_key(path.as_str()), "missing {path}");
        assert_eq!(tree.leaves.len(), 2);
    }

    #[test]
    fn repository_cache_view_includes_algorithm_directories() {
        let tree = View::RepositoryCache
            .tree(&sample_manifest(), Algorithm::Sha256)
            .unwrap();
        let hex = Algorithm::Sha256
            .digest_of_bytes(b"other")
            .hex(Algorithm::Sha256);
        let path = format!("content_addressable/sha256/{hex}/file");
        match tree.lookup(&path) {
            Some(Node::Leaf(leaf)) => assert!(leaf.executable),
            other => panic!("expected leaf at {path}, got {other:?}"),
        }
    }

    #[test]
    fn cas_views_collapse_mirrors_of_identical_content() {
        let sri = sri_of(b"same bytes");
        let json = format!(
            r#"{{"paths": {{
                "x": {{"uris": ["https://a.test/x"], "integrity": "{sri}", "size": 10}},
                "y": {{"uris": ["https://b.test/y"], "integrity": "{sri}", "size": 10}}
            }}}}"#
        );
        let manifest = Manifest::parse(json.as_bytes()).unwrap();
        let tree = View::BazelDiskCache.tree(&manifest, Algorithm::Sha256).unwrap();
        assert_eq!(tree.leaves.len(), 1);
        let leaf = tree.leaves.values().next().unwrap();
        assert_eq!(leaf.uris.len(), 2);
    }

    #[test]
    fn bazel_repo_view_adds_repo_files() {
        let tree = View::BazelRepo
            .tree(&sample_manifest(), Algorithm::Sha256)
            .unwrap();
        assert!(tree.leaves.contains_key("REPO.bazel"));
        assert!(tree.leaves.contains_key("BUILD.bazel"));
        assert!(tree.leaves.contains_key("a/one"));

        let build = &tree.leaves["BUILD.bazel"];
        assert_eq!(build.size_hint, BAZEL_BUILD_FILE.len() as i64);
        assert!(build.uris.is_empty());
        // Content is addressable up front.
        let expected = Algorithm::Sha256.digest_of_bytes(BAZEL_BUILD_FILE);
        assert_eq!(
            build.integrity.checksum_for(Algorithm::Sha256).unwrap(),
            expected.checksum(Algorithm::Sha256)
        );
    }

    #[test]
    fn default_view_matches_plain_tree() {
        let manifest = sample_manifest();
        let via_view = View::Default.tree(&manifest, Algorithm::Sha256).unwrap();
        let direct = ManifestTree::from_manifest(&manifest).unwrap();
        assert_eq!(
            via_view.leaves.keys().collect::<Vec<_>>(),
            direct.leaves.keys().collect::<Vec<_>>()
        );
    }
}
