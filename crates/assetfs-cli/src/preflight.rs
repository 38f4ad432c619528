//! Fail-fast checks before mounting.
//!
//! Mounting over a path that already carries a mount (a forgotten
//! previous instance, usually) produces confusing shadowed trees, so
//! the mountpoint is checked against `/proc/self/mountinfo` first.

use std::path::Path;

use anyhow::{Context, Result};

/// Mountpoints currently visible to this process, parsed from
/// `/proc/self/mountinfo`. Field five of each line is the mountpoint;
/// octal escapes (`\040` for spaces) are left as-is since we only
/// compare whole paths that went through the same encoding.
#[cfg(target_os = "linux")]
fn current_mountpoints() -> Result<Vec<String>> {
    let raw = std::fs::read_to_string("/proc/self/mountinfo")
        .context("reading /proc/self/mountinfo")?;
    Ok(parse_mountpoints(&raw))
}

#[cfg(not(target_os = "linux"))]
fn current_mountpoints() -> Result<Vec<String>> {
    Ok(Vec::new())
}

fn parse_mountpoints(mountinfo: &str) -> Vec<String> {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(str::to_string)
        .collect()
}

/// Errors when `mountpoint` is already a mountpoint.
pub fn ensure_not_mounted(mountpoint: &Path) -> Result<()> {
    let canonical = mountpoint
        .canonicalize()
        .unwrap_or_else(|_| mountpoint.to_path_buf());
    let canonical = canonical.to_string_lossy();
    for mounted in current_mountpoints()? {
        if mounted == canonical {
            anyhow::bail!(
                "{} is already a mountpoint; unmount it first (fusermount -u)",
                canonical
            );
        }
    }
    Ok(())
}
