//! Cgroup resource confinement.
//!
//! Detects whether the host runs the v2 unified hierarchy or the v1 split
//! layout, creates a per-sandbox group directory, writes memory and CPU
//! limits, attaches the confined process, and removes the group after the
//! process has been reaped. The cgroup root is injectable so the whole
//! control surface can be exercised against a plain directory tree.

pub mod cpu;
pub mod memory;

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use safebox_common::constants::{CGROUP_ROOT, CGROUP_V1_MEMORY_DIR, CGROUP_V2_MARKER};
use safebox_common::error::{Result, SafeboxError};
use safebox_common::types::{Degradation, DegradationKind, GroupName, ResourceLimits};

/// Controllers requested from the parent of a v2 group.
const V2_CONTROLLERS: [&str; 2] = ["memory", "cpu"];

/// Cgroup hierarchy layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersion {
    /// One hierarchy per controller; groups live under `<root>/memory`.
    V1,
    /// Unified hierarchy; groups live directly under the root.
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// Entry point for cgroup operations under one cgroup root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimiter {
    root: PathBuf,
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::new(CGROUP_ROOT)
    }
}

impl ResourceLimiter {
    /// Creates a limiter for the hierarchy mounted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Mount point this limiter operates under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Probes the hierarchy version.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::ResourceLimit`] if neither layout is present.
    pub fn detect(&self) -> Result<CgroupVersion> {
        if self.root.join(CGROUP_V2_MARKER).is_file() {
            Ok(CgroupVersion::V2)
        } else if self.root.join(CGROUP_V1_MEMORY_DIR).is_dir() {
            Ok(CgroupVersion::V1)
        } else {
            Err(SafeboxError::ResourceLimit {
                message: format!("no cgroup hierarchy found at {}", self.root.display()),
            })
        }
    }

    fn parent_dir(&self, version: CgroupVersion) -> PathBuf {
        match version {
            CgroupVersion::V2 => self.root.clone(),
            CgroupVersion::V1 => self.root.join(CGROUP_V1_MEMORY_DIR),
        }
    }

    /// Creates the group `name`, or joins it if it already exists.
    ///
    /// Only a handle whose directory was created by this call removes it on
    /// teardown.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::ResourceLimit`] if the hierarchy is missing or
    /// the directory cannot be created.
    pub fn create(&self, name: &GroupName) -> Result<CgroupHandle> {
        let version = self.detect()?;
        let parent = self.parent_dir(version);
        if version == CgroupVersion::V2 {
            enable_controllers(&parent);
        }

        let path = parent.join(name.as_str());
        let owned = match std::fs::create_dir(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
            Err(e) => {
                return Err(SafeboxError::ResourceLimit {
                    message: format!("creating {} failed: {e}", path.display()),
                });
            }
        };
        tracing::info!(
            path = %path.display(),
            %version,
            owned,
            "cgroup ready"
        );
        Ok(CgroupHandle {
            name: name.clone(),
            path,
            version,
            owned,
            attached: Vec::new(),
        })
    }

    /// Opens an existing group without taking ownership of it.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::ResourceLimit`] if the hierarchy or the group
    /// directory is missing.
    pub fn open(&self, name: &GroupName) -> Result<CgroupHandle> {
        let version = self.detect()?;
        let path = self.parent_dir(version).join(name.as_str());
        if !path.is_dir() {
            return Err(SafeboxError::ResourceLimit {
                message: format!("cgroup {} does not exist", path.display()),
            });
        }
        Ok(CgroupHandle {
            name: name.clone(),
            path,
            version,
            owned: false,
            attached: Vec::new(),
        })
    }
}

/// Best-effort `+memory +cpu` delegation in the parent's subtree control.
fn enable_controllers(parent: &Path) {
    let control = parent.join("cgroup.subtree_control");
    if !control.exists() {
        return;
    }
    for controller in V2_CONTROLLERS {
        if let Err(e) = std::fs::write(&control, format!("+{controller}")) {
            tracing::debug!(controller, error = %e, "could not enable controller");
        }
    }
}

/// One resource group directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    name: GroupName,
    path: PathBuf,
    version: CgroupVersion,
    owned: bool,
    attached: Vec<i32>,
}

impl CgroupHandle {
    /// Group name.
    #[must_use]
    pub const fn name(&self) -> &GroupName {
        &self.name
    }

    /// Group directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hierarchy version the group lives in.
    #[must_use]
    pub const fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Whether this handle created the directory.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        self.owned
    }

    /// Pids attached through this handle.
    #[must_use]
    pub fn attached(&self) -> &[i32] {
        &self.attached
    }

    /// Writes every configured limit, collecting the ones that failed.
    #[must_use]
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Vec<Degradation> {
        let mut degradations = Vec::new();
        if let Some(bytes) = limits.memory_bytes {
            if let Err(e) = self.set_memory_limit(bytes) {
                tracing::warn!(group = %self.name, error = %e, "memory limit not applied");
                degradations.push(Degradation::new(DegradationKind::MemoryLimit, e.to_string()));
            }
        }
        if let Some(quota) = limits.cpu {
            if let Err(e) = self.set_cpu_quota(quota) {
                tracing::warn!(group = %self.name, error = %e, "CPU quota not applied");
                degradations.push(Degradation::new(DegradationKind::CpuLimit, e.to_string()));
            }
        }
        degradations
    }

    /// Writes the memory ceiling.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit file rejects the write.
    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        memory::set_memory_limit(&self.path, self.version, bytes)
    }

    /// Reads the memory ceiling back; `None` means unlimited.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit file cannot be read or parsed.
    pub fn memory_limit(&self) -> Result<Option<u64>> {
        memory::read_memory_limit(&self.path, self.version)
    }

    /// Writes the CPU bandwidth limit.
    ///
    /// # Errors
    ///
    /// Returns an error on v1 hierarchies or if `cpu.max` rejects the write.
    pub fn set_cpu_quota(&self, quota: safebox_common::types::CpuQuota) -> Result<()> {
        match self.version {
            CgroupVersion::V2 => cpu::set_cpu_max(&self.path, quota),
            CgroupVersion::V1 => Err(SafeboxError::ResourceLimit {
                message: "CPU quota requires the cgroup v2 hierarchy".into(),
            }),
        }
    }

    /// Moves `pid` into the group.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::ResourceLimit`] if `cgroup.procs` rejects the
    /// write.
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let procs = self.path.join("cgroup.procs");
        std::fs::write(&procs, pid.to_string()).map_err(|e| SafeboxError::ResourceLimit {
            message: format!("attaching pid {pid} to {} failed: {e}", self.path.display()),
        })?;
        self.attached.push(pid);
        tracing::debug!(pid, group = %self.name, "added process to cgroup");
        Ok(())
    }

    /// Returns whether `pid` is listed in the group's `cgroup.procs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership file cannot be read.
    pub fn contains(&self, pid: i32) -> Result<bool> {
        let procs = self.path.join("cgroup.procs");
        let content = std::fs::read_to_string(&procs).map_err(|e| SafeboxError::Io {
            path: procs,
            source: e,
        })?;
        Ok(content
            .split_whitespace()
            .any(|entry| entry.parse::<i32>().ok() == Some(pid)))
    }

    /// Removes the group directory if this handle created it.
    ///
    /// Errors are not propagated: the directory may briefly still hold the
    /// exited process, or may already be gone.
    #[must_use]
    pub fn teardown(self) -> Option<Degradation> {
        if !self.owned {
            tracing::debug!(group = %self.name, "cgroup not owned, left in place");
            return None;
        }
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "cgroup destroyed");
                None
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cgroup removal failed");
                Some(Degradation::new(
                    DegradationKind::Teardown,
                    format!("removing {} failed: {e}", self.path.display()),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safebox_common::types::CpuQuota;

    fn v2_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CGROUP_V2_MARKER), "cpu memory").unwrap();
        std::fs::write(dir.path().join("cgroup.subtree_control"), "").unwrap();
        dir
    }

    fn v1_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(CGROUP_V1_MEMORY_DIR)).unwrap();
        dir
    }

    #[test]
    fn detects_both_layouts() {
        let v2 = v2_root();
        let v1 = v1_root();
        let empty = tempfile::tempdir().unwrap();
        assert_eq!(ResourceLimiter::new(v2.path()).detect().unwrap(), CgroupVersion::V2);
        assert_eq!(ResourceLimiter::new(v1.path()).detect().unwrap(), CgroupVersion::V1);
        assert!(ResourceLimiter::new(empty.path()).detect().is_err());
    }

    #[test]
    fn create_is_idempotent_and_tracks_ownership() {
        let root = v2_root();
        let limiter = ResourceLimiter::new(root.path());
        let name = GroupName::new("g1").unwrap();

        let first = limiter.create(&name).unwrap();
        let second = limiter.create(&name).unwrap();
        assert!(first.is_owned());
        assert!(!second.is_owned());
        assert_eq!(first.path(), root.path().join("g1"));
    }

    #[test]
    fn v1_groups_live_under_memory_controller() {
        let root = v1_root();
        let handle = ResourceLimiter::new(root.path())
            .create(&GroupName::new("g1").unwrap())
            .unwrap();
        assert_eq!(handle.path(), root.path().join("memory").join("g1"));

        handle.set_memory_limit(104_857_600).unwrap();
        let written = std::fs::read_to_string(handle.path().join("memory.limit_in_bytes")).unwrap();
        assert_eq!(written, "104857600");
    }

    #[test]
    fn memory_limit_round_trips() {
        let root = v2_root();
        let handle = ResourceLimiter::new(root.path())
            .create(&GroupName::generate())
            .unwrap();
        handle.set_memory_limit(209_715_200).unwrap();
        assert_eq!(handle.memory_limit().unwrap(), Some(209_715_200));
    }

    #[test]
    fn cpu_quota_on_v1_degrades() {
        let root = v1_root();
        let handle = ResourceLimiter::new(root.path())
            .create(&GroupName::generate())
            .unwrap();
        let limits = ResourceLimits {
            memory_bytes: Some(1 << 20),
            cpu: Some(CpuQuota {
                quota_us: 50_000,
                period_us: 100_000,
            }),
        };
        let degradations = handle.apply_limits(&limits);
        assert_eq!(degradations.len(), 1);
        assert_eq!(degradations[0].kind, DegradationKind::CpuLimit);
    }

    #[test]
    fn attach_writes_membership() {
        let root = v2_root();
        let mut handle = ResourceLimiter::new(root.path())
            .create(&GroupName::generate())
            .unwrap();
        handle.attach(4242).unwrap();
        assert!(handle.contains(4242).unwrap());
        assert_eq!(handle.attached(), &[4242]);
    }

    #[test]
    fn distinct_generated_names_do_not_interfere() {
        let root = v2_root();
        let limiter = ResourceLimiter::new(root.path());
        let mut a = limiter.create(&GroupName::generate()).unwrap();
        let mut b = limiter.create(&GroupName::generate()).unwrap();
        a.attach(100).unwrap();
        b.attach(200).unwrap();
        assert!(a.contains(100).unwrap() && !a.contains(200).unwrap());
        assert!(b.contains(200).unwrap() && !b.contains(100).unwrap());
    }

    #[test]
    fn shared_fixed_name_collides() {
        let root = v2_root();
        let limiter = ResourceLimiter::new(root.path());
        let name = GroupName::new("safebox").unwrap();
        let mut a = limiter.create(&name).unwrap();
        let mut b = limiter.create(&name).unwrap();
        a.attach(100).unwrap();
        b.attach(200).unwrap();
        assert_eq!(a.path(), b.path());
        // Both invocations now observe one shared membership file.
        assert!(a.contains(200).unwrap());
    }

    #[test]
    fn teardown_removes_only_owned_groups() {
        let root = v2_root();
        let limiter = ResourceLimiter::new(root.path());
        let name = GroupName::new("g1").unwrap();
        let owner = limiter.create(&name).unwrap();
        let joiner = limiter.open(&name).unwrap();

        assert!(joiner.teardown().is_none());
        assert!(root.path().join("g1").is_dir());
        assert!(owner.teardown().is_none());
        assert!(!root.path().join("g1").exists());
    }

    #[test]
    fn teardown_failure_is_a_degradation() {
        let root = v2_root();
        let handle = ResourceLimiter::new(root.path())
            .create(&GroupName::generate())
            .unwrap();
        // Regular files keep a plain directory from being removed.
        handle.set_memory_limit(1 << 20).unwrap();
        let degradation = handle.teardown().unwrap();
        assert_eq!(degradation.kind, DegradationKind::Teardown);
    }

    #[test]
    fn open_missing_group_fails() {
        let root = v2_root();
        let limiter = ResourceLimiter::new(root.path());
        assert!(limiter.open(&GroupName::new("absent").unwrap()).is_err());
    }
}
