//! Memory ceiling control.
//!
//! v2 uses `memory.max`, where `max` means unlimited; v1 uses
//! `memory.limit_in_bytes`.

use std::path::{Path, PathBuf};

use safebox_common::error::{Result, SafeboxError};

use super::CgroupVersion;

fn limit_file(cgroup_path: &Path, version: CgroupVersion) -> PathBuf {
    match version {
        CgroupVersion::V2 => cgroup_path.join("memory.max"),
        CgroupVersion::V1 => cgroup_path.join("memory.limit_in_bytes"),
    }
}

/// Sets the hard memory limit for a cgroup.
///
/// # Errors
///
/// Returns an error if writing the limit file fails.
pub fn set_memory_limit(cgroup_path: &Path, version: CgroupVersion, bytes: u64) -> Result<()> {
    let file = limit_file(cgroup_path, version);
    std::fs::write(&file, bytes.to_string()).map_err(|e| SafeboxError::ResourceLimit {
        message: format!("writing {} failed: {e}", file.display()),
    })?;
    tracing::debug!(bytes, file = %file.display(), "memory limit set");
    Ok(())
}

/// Reads the hard memory limit back.
///
/// # Errors
///
/// Returns an error if the limit file cannot be read or holds an unexpected
/// value.
pub fn read_memory_limit(cgroup_path: &Path, version: CgroupVersion) -> Result<Option<u64>> {
    let file = limit_file(cgroup_path, version);
    let content = std::fs::read_to_string(&file).map_err(|e| SafeboxError::Io {
        path: file.clone(),
        source: e,
    })?;
    parse_limit(content.trim()).ok_or_else(|| SafeboxError::ResourceLimit {
        message: format!("unexpected value {:?} in {}", content.trim(), file.display()),
    })
}

fn parse_limit(value: &str) -> Option<Option<u64>> {
    if value == "max" {
        return Some(None);
    }
    value.parse::<u64>().ok().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_means_unlimited() {
        assert_eq!(parse_limit("max"), Some(None));
        assert_eq!(parse_limit("1048576"), Some(Some(1_048_576)));
        assert_eq!(parse_limit("lots"), None);
    }

    #[test]
    fn reads_unlimited_v2_group() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.max"), "max\n").unwrap();
        assert_eq!(read_memory_limit(dir.path(), CgroupVersion::V2).unwrap(), None);
    }
}
