//! UTS namespace isolation.
//!
//! Allows the confined process to have its own hostname.

use safebox_common::error::{StepError, StepResult};

/// Sets the hostname inside the UTS namespace.
///
/// # Errors
///
/// Returns the failed `sethostname(2)` call.
pub fn set_hostname(hostname: &str) -> StepResult {
    nix::unistd::sethostname(hostname).map_err(|e| StepError::new("sethostname", e as i32))
}
