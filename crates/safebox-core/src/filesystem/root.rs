//! Root directory switching via `chroot(2)`.
//!
//! The working directory is moved into the new root first, so no directory
//! handle of the old root survives the switch.

use std::path::Path;

use nix::unistd::{chdir, chroot};

use safebox_common::error::{StepError, StepResult};

/// Makes `new_root` the process's `/` and its working directory.
///
/// Requires `CAP_SYS_CHROOT` in the current user namespace.
///
/// # Errors
///
/// Returns the failed `chdir(2)` or `chroot(2)` call.
pub fn change_root(new_root: &Path) -> StepResult {
    chdir(new_root).map_err(|e| StepError::new("chdir into new root", e as i32))?;
    chroot(".").map_err(|e| StepError::new("chroot", e as i32))?;
    chdir("/").map_err(|e| StepError::new("chdir / after chroot", e as i32))
}
