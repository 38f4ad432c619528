//! # assetfs-config
//!
//! Global configuration shared by every subcommand. Read from a JSON
//! file (path from `--config` or the `ASSETFS_CONFIG_FILE` environment
//! variable), with command-line flags layered on top by the CLI.

pub mod logging;

use std::path::{Path, PathBuf};

use assetfs_integrity::Algorithm;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_FILE_ENV: &str = "ASSETFS_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config validation failed:\n  {}", issues.join("\n  "))]
    Invalid { issues: Vec<String> },
}

/// How digest hashes are rendered in extended attributes. Bazel reads
/// raw bytes; Buck2 reads lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XattrEncoding {
    #[default]
    Raw,
    Hex,
}

impl XattrEncoding {
    pub fn from_name(name: &str) -> Option<XattrEncoding> {
        match name {
            "raw" => Some(XattrEncoding::Raw),
            "hex" => Some(XattrEncoding::Hex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The hash function used to name blobs in the local and remote CAS.
    pub digest_function: String,
    /// Name of the extended attribute exposing the primary digest.
    /// Should match Bazel's `--unix_digest_hash_attribute_name`. Empty
    /// disables the custom name; `user.<algorithm>` always works.
    pub unix_digest_hash_attribute_name: String,
    /// Encoding of the digest xattr value: "raw" or "hex".
    pub unix_digest_hash_attribute_encoding: String,
    /// Path to the manifest file.
    pub manifest: PathBuf,
    /// How the manifest is rendered: "default", "uri",
    /// "repository_cache", "bazel_disk_cache" or "bazel_repo".
    pub view: String,
    /// Root directory of the local (disk) CAS.
    pub disk_cache: PathBuf,
    /// grpc(s) endpoint serving the remote CAS and remote asset
    /// services. Empty disables the remote tiers.
    pub remote: String,
    /// Credential helper executable, queried per URI.
    pub credential_helper: String,
    /// Propagate credential-helper headers to the remote asset service
    /// as qualifiers.
    pub remote_downloader_propagate_credentials: bool,
    /// Diagnostic mode: every read on a leaf fails with EBADF, proving
    /// that consumers satisfy themselves via digests alone.
    pub fail_reads: bool,
    /// Log level: "error", "warn", "info" or "debug".
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            digest_function: "sha256".to_string(),
            unix_digest_hash_attribute_name: String::new(),
            unix_digest_hash_attribute_encoding: "raw".to_string(),
            manifest: PathBuf::from("manifest.json"),
            view: "default".to_string(),
            disk_cache: PathBuf::from("~/.cache/assetfs"),
            remote: String::new(),
            credential_helper: String::new(),
            remote_downloader_propagate_credentials: false,
            fail_reads: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads a config file over the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&contents)?;
        Ok(config)
    }

    /// The config file to use: an explicit flag wins, then the
    /// environment, then the built-in default path.
    pub fn resolve_path(flag: Option<PathBuf>) -> Option<PathBuf> {
        flag.or_else(|| std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();
        if Algorithm::from_name(&self.digest_function).is_none() {
            issues.push(
                r#"digest_function must be one of "sha256", "sha384", "sha512", "blake3""#
                    .to_string(),
            );
        }
        if XattrEncoding::from_name(&self.unix_digest_hash_attribute_encoding).is_none() {
            issues.push(
                r#"unix_digest_hash_attribute_encoding must be "raw" or "hex""#.to_string(),
            );
        }
        if self.manifest.as_os_str().is_empty() {
            issues.push("manifest must be provided".to_string());
        }
        match self.view.as_str() {
            "default" | "uri" | "repository_cache" | "bazel_disk_cache" | "bazel_repo" => {}
            _ => issues.push(
                r#"view must be one of "default", "uri", "repository_cache", "bazel_disk_cache", "bazel_repo""#
                    .to_string(),
            ),
        }
        if self.disk_cache.as_os_str().is_empty() {
            issues.push("disk_cache must be provided".to_string());
        }
        if !self.remote.is_empty()
            && !self.remote.starts_with("grpc://")
            && !self.remote.starts_with("grpcs://")
        {
            issues.push(r#"remote must start with "grpc://" or "grpcs://""#.to_string());
        }
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" => {}
            _ => issues.push(
                r#"log_level must be one of "error", "warn", "info", "debug""#.to_string(),
            ),
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { issues })
        }
    }

    pub fn digest_function(&self) -> Algorithm {
        Algorithm::from_name(&self.digest_function).unwrap_or(Algorithm::Sha256)
    }

    pub fn xattr_encoding(&self) -> XattrEncoding {
        XattrEncoding::from_name(&self.unix_digest_hash_attribute_encoding)
            .unwrap_or(XattrEncoding::Raw)
    }

    /// Expands a leading `~/` against `$HOME`.
    pub fn disk_cache_path(&self) -> PathBuf {
        expand_home(&self.disk_cache)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn load_overrides_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "digest_function": "blake3",
                "unix_digest_hash_attribute_name": "user.sha256",
                "unix_digest_hash_attribute_encoding": "hex",
                "manifest": "/tmp/m.json",
                "remote": "grpcs://remote.example.test",
                "fail_reads": true
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.digest_function(), Algorithm::Blake3);
        assert_eq!(config.xattr_encoding(), XattrEncoding::Hex);
        assert!(config.fail_reads);
        // Untouched fields keep their defaults.
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn validation_aggregates_issues() {
        let config = Config {
            digest_function: "md5".to_string(),
            remote: "http://not-grpc".to_string(),
            log_level: "loud".to_string(),
            ..Config::default()
        };
        match config.validate() {
            Err(ConfigError::Invalid { issues }) => assert_eq!(issues.len(), 3),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = serde_json::from_str(r#"{"frobnicate": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn home_expansion() {
        std::env::set_var("HOME", "/home/builder");
        let config = Config {
            disk_cache: PathBuf::from("~/.cache/assetfs"),
            ..Config::default()
        };
        assert_eq!(
            config.disk_cache_path(),
            PathBuf::from("/home/builder/.cache/assetfs")
        );
    }
}
