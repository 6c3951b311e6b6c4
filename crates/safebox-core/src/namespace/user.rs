//! User namespace identity mapping.
//!
//! Maps ids inside the confined process's user namespace to host ids, so the
//! process can look like root inside its namespace while staying
//! unprivileged on the host. The mapping is written by the supervisor, once,
//! through `/proc/<pid>/{uid_map,setgroups,gid_map}`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use safebox_common::error::{Result, SafeboxError};

/// One contiguous id range: `range` ids starting at `container_id` inside the
/// namespace correspond to ids starting at `host_id` outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First id inside the namespace.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids mapped.
    pub range: u32,
}

impl IdRange {
    /// Renders the range as a line of a `uid_map`/`gid_map` file.
    #[must_use]
    pub fn to_map_line(&self) -> String {
        format!("{} {} {}\n", self.container_id, self.host_id, self.range)
    }

    /// Returns whether `id` (namespace side) is covered by the range.
    #[must_use]
    pub const fn contains(&self, id: u32) -> bool {
        id >= self.container_id && id - self.container_id < self.range
    }
}

/// Uid and gid mapping for a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    /// Mapping written to `uid_map`.
    pub uid: IdRange,
    /// Mapping written to `gid_map`.
    pub gid: IdRange,
}

impl IdentityMapping {
    /// Maps namespace root onto the calling process's effective uid and gid.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn root_to_current_user() -> Self {
        Self::current_user_as(0, 0)
    }

    /// Maps the single namespace identity `(uid, gid)` onto the calling
    /// process's effective uid and gid.
    ///
    /// A single-id mapping of the caller's own ids is the only one an
    /// unprivileged supervisor may write.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn current_user_as(uid: u32, gid: u32) -> Self {
        Self {
            uid: IdRange {
                container_id: uid,
                host_id: nix::unistd::geteuid().as_raw(),
                range: 1,
            },
            gid: IdRange {
                container_id: gid,
                host_id: nix::unistd::getegid().as_raw(),
                range: 1,
            },
        }
    }

    /// Maps `range` ids starting at namespace root onto a subordinate host
    /// range starting at `host_base`, for both uid and gid.
    #[must_use]
    pub const fn subordinate(host_base: u32, range: u32) -> Self {
        let ids = IdRange {
            container_id: 0,
            host_id: host_base,
            range,
        };
        Self { uid: ids, gid: ids }
    }
}

/// Writes `mapping` for the process `pid`.
///
/// # Errors
///
/// Returns [`SafeboxError::Mapping`] naming the control file that rejected
/// the write.
pub fn write_identity_mapping(pid: i32, mapping: &IdentityMapping) -> Result<()> {
    write_identity_mapping_at(&PathBuf::from(format!("/proc/{pid}")), mapping)?;
    tracing::debug!(pid, ?mapping, "wrote UID/GID map");
    Ok(())
}

/// Writes `mapping` into the control files under `proc_dir`.
///
/// `setgroups` is set to `deny` before `gid_map` is written: kernels refuse
/// an unprivileged `gid_map` write while `setgroups(2)` is still allowed.
/// Kernels without the `setgroups` file predate that check.
///
/// # Errors
///
/// Returns [`SafeboxError::Mapping`] if any write fails.
pub fn write_identity_mapping_at(proc_dir: &Path, mapping: &IdentityMapping) -> Result<()> {
    write_control(&proc_dir.join("uid_map"), &mapping.uid.to_map_line())?;

    let setgroups_path = proc_dir.join("setgroups");
    if setgroups_path.exists() {
        write_control(&setgroups_path, "deny")?;
    }

    write_control(&proc_dir.join("gid_map"), &mapping.gid.to_map_line())
}

fn write_control(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|e| SafeboxError::Mapping {
        path: path.to_path_buf(),
        source: e,
    })
}
