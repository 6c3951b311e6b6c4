//! Privilege reduction inside the confined process.
//!
//! The sequence is fixed: `no_new_privs`, optional root switch, the
//! capability bounding set, supplementary groups, gid, uid, the remaining
//! capability sets, then a check that the old identity cannot be regained.
//! The gid is changed while the process still holds `CAP_SETGID`.
//!
//! The kernel only clears capabilities on a uid change when the old uid was
//! root of the current user namespace. A process created by host root inside
//! a fresh user namespace is not, since host uid 0 is unmapped there, so the
//! capability sets are emptied explicitly.

use std::path::PathBuf;

use nix::unistd::{Gid, Uid, User};
use serde::{Deserialize, Serialize};

use safebox_common::error::{Result, SafeboxError, StepError, StepResult};

use crate::filesystem::root::change_root;

/// Identity the confined process runs as after the drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropIdentity {
    /// A named account looked up in the user database.
    Account(String),
    /// Explicit numeric ids.
    Ids {
        /// Target uid.
        uid: u32,
        /// Target gid.
        gid: u32,
    },
}

impl Default for DropIdentity {
    fn default() -> Self {
        Self::Account(safebox_common::constants::UNPRIVILEGED_ACCOUNT.to_string())
    }
}

impl DropIdentity {
    /// Resolves the identity to numeric credentials.
    ///
    /// Resolution happens in the supervisor, before any root switch, so the
    /// host user database is the one consulted.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::PrivilegeDrop`] if the account is unknown or
    /// the target is root.
    pub fn resolve(&self) -> Result<Credentials> {
        let credentials = match self {
            Self::Account(name) => {
                let user = User::from_name(name)
                    .map_err(|e| SafeboxError::PrivilegeDrop {
                        message: format!("looking up account {name:?} failed: {e}"),
                    })?
                    .ok_or_else(|| SafeboxError::PrivilegeDrop {
                        message: format!("account {name:?} does not exist"),
                    })?;
                Credentials {
                    uid: user.uid.as_raw(),
                    gid: user.gid.as_raw(),
                }
            }
            Self::Ids { uid, gid } => Credentials {
                uid: *uid,
                gid: *gid,
            },
        };
        if credentials.uid == 0 || credentials.gid == 0 {
            return Err(SafeboxError::PrivilegeDrop {
                message: format!(
                    "refusing to drop to root identity (uid={}, gid={})",
                    credentials.uid, credentials.gid
                ),
            });
        }
        Ok(credentials)
    }
}

/// Resolved numeric identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// Everything the confined process needs to shed its privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegePlan {
    /// Directory that becomes `/`, if any.
    pub new_root: Option<PathBuf>,
    /// Identity to switch to.
    pub credentials: Credentials,
    /// Whether supplementary groups are replaced. Not possible inside a user
    /// namespace whose `setgroups` file was set to `deny`.
    pub clear_groups: bool,
}

/// Sets the `no_new_privs` bit for this process and its descendants.
///
/// # Errors
///
/// Returns the failed `prctl(2)` call.
pub fn set_no_new_privs() -> StepResult {
    nix::sys::prctl::set_no_new_privs().map_err(|e| StepError::new("PR_SET_NO_NEW_PRIVS", e as i32))
}

/// Runs the full drop described by `plan`.
///
/// Runs between `clone(2)` and exec, so it neither allocates nor logs.
///
/// # Errors
///
/// Returns the first failing call or check; the process must not continue
/// to exec in that case.
pub fn drop_privileges(plan: &PrivilegePlan) -> StepResult {
    set_no_new_privs()?;

    if let Some(root) = &plan.new_root {
        change_root(root)?;
    }

    drop_bounding_set()?;
    clear_ambient()?;

    let Credentials { uid, gid } = plan.credentials;
    let (uid, gid) = (Uid::from_raw(uid), Gid::from_raw(gid));

    if plan.clear_groups {
        nix::unistd::setgroups(&[gid]).map_err(|e| StepError::new("setgroups", e as i32))?;
    }
    nix::unistd::setresgid(gid, gid, gid).map_err(|e| StepError::new("setresgid", e as i32))?;
    nix::unistd::setresuid(uid, uid, uid).map_err(|e| StepError::new("setresuid", e as i32))?;
    set_capabilities(&[CapData::default(); 2])?;

    verify_dropped(uid, gid)
}

fn verify_dropped(uid: Uid, gid: Gid) -> StepResult {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    if getuid() != uid || geteuid() != uid || getgid() != gid || getegid() != gid {
        return Err(StepError::check("identity differs from the drop target"));
    }
    let held = read_capabilities()?;
    if cap_mask(&held, |d| d.effective) != 0 || cap_mask(&held, |d| d.permitted) != 0 {
        return Err(StepError::check("capabilities still held after the drop"));
    }
    if nix::unistd::setuid(Uid::from_raw(0)).is_ok() {
        return Err(StepError::check("root identity could be regained after the drop"));
    }
    Ok(())
}

/// Highest capability number tried when emptying the bounding set. The
/// kernel answers `EINVAL` past its own last capability.
const CAP_SCAN_LIMIT: libc::c_ulong = 64;

/// `_LINUX_CAPABILITY_VERSION_3`: two 32-bit words per set.
const CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Removes every capability from the bounding set so none can be gained
/// back through exec.
fn drop_bounding_set() -> StepResult {
    for cap in 0..CAP_SCAN_LIMIT {
        // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc == 0 {
            continue;
        }
        let err = StepError::last_os("PR_CAPBSET_DROP");
        if err.errno == libc::EINVAL {
            break;
        }
        return Err(err);
    }
    Ok(())
}

fn clear_ambient() -> StepResult {
    // SAFETY: PR_CAP_AMBIENT_CLEAR_ALL takes no pointers.
    let rc = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        )
    };
    if rc != 0 {
        let err = StepError::last_os("PR_CAP_AMBIENT_CLEAR_ALL");
        // Kernels before 4.3 have no ambient set.
        if err.errno != libc::EINVAL {
            return Err(err);
        }
    }
    Ok(())
}

fn set_capabilities(data: &[CapData; 2]) -> StepResult {
    let header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    // SAFETY: the header names this thread and version 3, which reads
    // exactly two data entries.
    let rc = unsafe { libc::syscall(libc::SYS_capset, &raw const header, data.as_ptr()) };
    if rc != 0 {
        return Err(StepError::last_os("capset"));
    }
    Ok(())
}

fn read_capabilities() -> StepResult<[CapData; 2]> {
    let mut header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapData::default(); 2];
    // SAFETY: version 3 writes exactly two entries into `data`.
    let rc = unsafe { libc::syscall(libc::SYS_capget, &raw mut header, data.as_mut_ptr()) };
    if rc != 0 {
        return Err(StepError::last_os("capget"));
    }
    Ok(data)
}

fn cap_mask(data: &[CapData; 2], set: impl Fn(&CapData) -> u32) -> u64 {
    (u64::from(set(&data[1])) << 32) | u64::from(set(&data[0]))
}

#[cfg(test)]
mod tests {
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    use super::*;

    /// Runs `body` in a forked child and returns how the child ended.
    fn in_child(body: impl FnOnce() -> i32) -> WaitStatus {
        // SAFETY: the child only changes its own credentials and `_exit`s;
        // it never returns into the test harness.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = body();
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => waitpid(child, None).unwrap(),
        }
    }

    fn nobody_plan() -> PrivilegePlan {
        PrivilegePlan {
            new_root: None,
            credentials: Credentials {
                uid: 65_534,
                gid: 65_534,
            },
            clear_groups: true,
        }
    }

    #[test]
    fn dropped_process_cannot_become_root_again() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let status = in_child(|| {
            if drop_privileges(&nobody_plan()).is_err() {
                return 2;
            }
            if nix::unistd::setuid(Uid::from_raw(0)).is_ok()
                || nix::unistd::setresgid(Gid::from_raw(0), Gid::from_raw(0), Gid::from_raw(0))
                    .is_ok()
            {
                return 3;
            }
            match read_capabilities() {
                Ok(held) if held.iter().all(|d| d.effective == 0 && d.permitted == 0) => 0,
                _ => 4,
            }
        });
        assert!(
            matches!(status, WaitStatus::Exited(_, 0)),
            "unexpected status {status:?}"
        );
    }

    #[test]
    fn capabilities_kept_across_uid_change_are_still_cleared() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        // With keep-caps set the uid change leaves the permitted set intact,
        // as it does for a process whose uid is unmapped in its namespace.
        let status = in_child(|| {
            // SAFETY: PR_SET_KEEPCAPS takes a flag and no pointers.
            if unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) } != 0 {
                return 2;
            }
            if drop_privileges(&nobody_plan()).is_err() {
                return 3;
            }
            match read_capabilities() {
                Ok(held) if cap_mask(&held, |d| d.permitted) == 0 => 0,
                _ => 4,
            }
        });
        assert!(
            matches!(status, WaitStatus::Exited(_, 0)),
            "unexpected status {status:?}"
        );
    }

    #[test]
    fn capability_words_combine_low_then_high() {
        let data = [
            CapData {
                effective: 0x1,
                ..CapData::default()
            },
            CapData {
                effective: 0x2,
                ..CapData::default()
            },
        ];
        assert_eq!(cap_mask(&data, |d| d.effective), 0x2_0000_0001);
        assert_eq!(cap_mask(&data, |d| d.permitted), 0);
    }

    #[test]
    fn default_identity_is_nobody() {
        assert_eq!(
            DropIdentity::default(),
            DropIdentity::Account("nobody".to_string())
        );
    }

    #[test]
    fn explicit_ids_resolve_directly() {
        let creds = DropIdentity::Ids {
            uid: 65_534,
            gid: 65_534,
        }
        .resolve()
        .unwrap();
        assert_eq!(creds, Credentials { uid: 65_534, gid: 65_534 });
    }

    #[test]
    fn root_target_is_rejected() {
        let err = DropIdentity::Ids { uid: 0, gid: 100 }.resolve().unwrap_err();
        assert_eq!(err.stage(), "privilege-drop");
    }

    #[test]
    fn unknown_account_is_rejected() {
        let identity = DropIdentity::Account("safebox-no-such-account".to_string());
        assert!(identity.resolve().is_err());
    }

    #[test]
    fn identity_json_forms() {
        let named: DropIdentity = serde_json::from_str(r#"{"account": "nobody"}"#).unwrap();
        assert_eq!(named, DropIdentity::default());
        let ids: DropIdentity =
            serde_json::from_str(r#"{"ids": {"uid": 1000, "gid": 1000}}"#).unwrap();
        assert_eq!(ids, DropIdentity::Ids { uid: 1000, gid: 1000 });
    }
}
