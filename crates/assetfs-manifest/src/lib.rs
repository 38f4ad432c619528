//! # assetfs-manifest
//!
//! The JSON manifest declaring the virtual filesystem's contents, and
//! the directory tree built from it.
//!
//! A manifest maps relative paths to entries carrying mirror URIs, SRI
//! integrity (one string or one per algorithm), an optional size hint
//! and an executable bit. Entries may omit their URIs when the manifest
//! supplies `uri_templates`, which are expanded per entry.

pub mod views;

pub use views::View;

use std::collections::BTreeMap;
use std::sync::Arc;

use assetfs_cas::Asset;
use assetfs_integrity::{Integrity, IntegrityError};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest is not syntactically valid JSON (or has unknown
    /// fields). The watcher treats this differently from semantic
    /// errors: a half-written file must not take the tree down.
    #[error("manifest decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("manifest validation failed:\n  {}", issues.join("\n  "))]
    Validation { issues: Vec<String> },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("insertion path {0:?} conflicts with an existing entry")]
    PathConflict(String),

    #[error("invalid manifest path {0:?}")]
    InvalidPath(String),
}

impl ManifestError {
    pub fn is_decode(&self) -> bool {
        matches!(self, ManifestError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// The raw manifest file shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub paths: BTreeMap<String, ManifestEntry>,
    #[serde(default)]
    pub uri_templates: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    /// Mirror URIs pointing at identical bytes. May be omitted when the
    /// manifest has `uri_templates`.
    #[serde(default)]
    pub uris: Vec<String>,
    /// One SRI string, or one per algorithm.
    pub integrity: IntegritySpec,
    /// Size in bytes, when known in advance. Lets the filesystem report
    /// sizes without resolving the asset.
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub executable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntegritySpec {
    One(String),
    Many(Vec<String>),
}

impl IntegritySpec {
    pub fn sris(&self) -> Vec<&str> {
        match self {
            IntegritySpec::One(s) => vec![s.as_str()],
            IntegritySpec::Many(list) => list.iter().map(|s| s.as_str()).collect(),
        }
    }
}

impl Manifest {
    pub fn parse(json: &[u8]) -> Result<Manifest> {
        Ok(serde_json::from_slice(json)?)
    }

    /// Fills in missing `uris` from the manifest's templates. Entries
    /// with explicit URIs are left alone.
    pub fn expand_templates(&mut self) {
        if self.uri_templates.is_empty() {
            return;
        }
        let templates = self.uri_templates.clone();
        for (path, entry) in self.paths.iter_mut() {
            if entry.uris.is_empty() {
                entry.uris = templates
                    .iter()
                    .map(|template| apply_template(template, path, entry))
                    .collect();
            }
        }
    }

    /// Validates every entry, aggregating all issues so the user sees
    /// the full damage at once. Non-fatal oddities are logged.
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(ManifestError::Validation {
                issues: vec!["empty manifest".to_string()],
            });
        }
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        for (path, entry) in &self.paths {
            let mut for_path = Vec::new();
            if let Err(e) = validate_path(path) {
                for_path.push(e);
            }
            if entry.uris.is_empty() {
                for_path.push("entry must have at least one URI".to_string());
            }
            for uri in &entry.uris {
                if !uri.starts_with("http://") && !uri.starts_with("https://") {
                    for_path.push(format!(
                        "\"uri\" must start with \"http://\" or \"https://\", got {uri:?}"
                    ));
                }
            }
            match Integrity::from_sris(entry.integrity.sris()) {
                Ok(integrity) if integrity.is_empty() => {
                    for_path.push("\"integrity\" may not be empty".to_string());
                }
                Ok(_) => {}
                Err(e) => for_path.push(e.to_string()),
            }
            match entry.size {
                Some(size) if size < 0 => {
                    for_path.push("\"size\" must be a non-negative integer".to_string());
                }
                Some(_) => {}
                None => warnings.push(format!(
                    "{path}: \"size\" was not provided - this may cause performance issues"
                )),
            }
            if !for_path.is_empty() {
                issues.push(format!("{path}: {}", for_path.join(", ")));
            }
        }
        if !warnings.is_empty() {
            warn!("manifest validation warnings:\n  {}", warnings.join("\n  "));
        }
        if !issues.is_empty() {
            return Err(ManifestError::Validation { issues });
        }
        Ok(())
    }
}

fn validate_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() || path.starts_with('/') {
        return Err(
            "path must be a non-empty path to the artifact, relative to the mount point"
                .to_string(),
        );
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err("path must not contain empty segments".to_string());
        }
        if segment == "." || segment == ".." {
            return Err("path must not contain '.' or '..' segments".to_string());
        }
    }
    Ok(())
}

/// Expands one URI template for one entry. Unknown placeholders are left
/// verbatim.
fn apply_template(template: &str, path: &str, entry: &ManifestEntry) -> String {
    let (dirname, basename) = match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => (".", path),
    };
    let (stem, ext) = match basename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (basename, String::new()),
    };

    let mut out = template
        .replace("{path}", path)
        .replace("{path_urlencoded}", &path_urlencode(path))
        .replace("{dirname}", dirname)
        .replace("{basename}", basename)
        .replace("{stem}", stem)
        .replace("{ext}", &ext);
    if let Some(size) = entry.size {
        out = out.replace("{size}", &size.to_string());
    }
    if let Ok(integrity) = Integrity::from_sris(entry.integrity.sris()) {
        for checksum in integrity.items() {
            out = out.replace(
                &format!("{{{}}}", checksum.algorithm.name()),
                &hex::encode(&checksum.hash),
            );
        }
    }
    out
}

/// Percent-encodes everything outside the RFC 3986 unreserved set,
/// including `/`, so a whole path fits in one URI segment.
fn path_urlencode(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// A leaf of the manifest tree: one asset plus filesystem metadata.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub uris: Vec<String>,
    pub integrity: Integrity,
    /// Size in bytes; negative when unknown.
    pub size_hint: i64,
    pub executable: bool,
}

impl Leaf {
    fn from_entry(entry: &ManifestEntry) -> Result<Leaf> {
        Ok(Leaf {
            uris: entry.uris.clone(),
            integrity: Integrity::from_sris(entry.integrity.sris())?,
            size_hint: entry.size.unwrap_or(-1),
            executable: entry.executable,
        })
    }

    pub fn to_asset(&self) -> Asset {
        let mut asset = Asset::new(self.uris.clone(), self.integrity.clone());
        asset.size_hint = self.size_hint;
        asset
    }
}

#[derive(Debug, Default)]
pub struct Directory {
    pub children: BTreeMap<String, Node>,
}

#[derive(Debug)]
pub enum Node {
    Directory(Directory),
    Leaf(Arc<Leaf>),
}

/// A fully built manifest tree. Replaced atomically as a whole on
/// manifest reload; nodes never mutate in place.
#[derive(Debug, Default)]
pub struct ManifestTree {
    pub root: Directory,
    /// Every leaf by its full path, for cache priming and bulk tooling.
    pub leaves: BTreeMap<String, Arc<Leaf>>,
}

impl ManifestTree {
    /// Parses, expands templates, validates and builds in one step.
    pub fn from_json(json: &[u8]) -> Result<ManifestTree> {
        let mut manifest = Manifest::parse(json)?;
        manifest.expand_templates();
        manifest.validate()?;
        ManifestTree::from_manifest(&manifest)
    }

    pub fn from_manifest(manifest: &Manifest) -> Result<ManifestTree> {
        let mut tree = ManifestTree::default();
        for (path, entry) in &manifest.paths {
            let leaf = Leaf::from_entry(entry)?;
            tree.insert(path, leaf)?;
        }
        Ok(tree)
    }

    fn insert(&mut self, path: &str, leaf: Leaf) -> Result<()> {
        if path.is_empty() || path.starts_with('/') {
            return Err(ManifestError::InvalidPath(path.to_string()));
        }
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments {
            if segment.is_empty() || *segment == "." || *segment == ".." {
                return Err(ManifestError::InvalidPath(path.to_string()));
            }
        }

        let mut current = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            let child = current
                .children
                .entry(segment.to_string())
                .or_insert_with(|| Node::Directory(Directory::default()));
            current = match child {
                Node::Directory(dir) => dir,
                Node::Leaf(_) => return Err(ManifestError::PathConflict(path.to_string())),
            };
        }

        let name = segments[segments.len() - 1];
        if current.children.contains_key(name) {
            return Err(ManifestError::PathConflict(path.to_string()));
        }
        let leaf = Arc::new(leaf);
        current
            .children
            .insert(name.to_string(), Node::Leaf(Arc::clone(&leaf)));
        self.leaves.insert(path.to_string(), leaf);
        Ok(())
    }

    /// Looks a node up by relative path.
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        let mut current = &self.root;
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            let node = current.children.get(segment)?;
            if segments.peek().is_none() {
                return Some(node);
            }
            current = match node {
                Node::Directory(dir) => dir,
                Node::Leaf(_) => return None,
            };
        }
        None
    }
}
