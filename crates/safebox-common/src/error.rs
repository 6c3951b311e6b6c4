//! Unified error types for the SafeBox workspace.
//!
//! Every variant of [`SafeboxError`] is a setup failure: the launch is aborted
//! before the confined program runs. Reduced-guarantee conditions are not
//! errors; they are reported as [`crate::types::Degradation`] values, and a
//! confined program dying from a signal is an [`crate::types::ExitOutcome`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SafeboxError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration or sandbox specification value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The confined process could not be created.
    #[error("failed to spawn confined process: {message}")]
    Spawn {
        /// Description of the creation failure.
        message: String,
    },

    /// Writing the user namespace identity mapping failed.
    #[error("identity mapping failed at {path}: {source}")]
    Mapping {
        /// Control file that rejected the write.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A mandatory mount step failed inside the confined process.
    #[error("mount isolation failed: {message}")]
    Mount {
        /// Description of the failed mount step.
        message: String,
    },

    /// Credentials could not be reduced to the unprivileged identity.
    #[error("privilege drop failed: {message}")]
    PrivilegeDrop {
        /// Description of the failed transition.
        message: String,
    },

    /// The syscall policy could not be validated, compiled, or loaded.
    #[error("syscall policy failed: {message}")]
    Policy {
        /// Description of the policy failure.
        message: String,
    },

    /// Resource limits could not be enforced in fail-closed mode.
    #[error("resource limit not enforced: {message}")]
    ResourceLimit {
        /// Description of the cgroup failure.
        message: String,
    },

    /// The confined program could not be executed.
    #[error("exec of {program} failed: {message}")]
    Exec {
        /// Program that failed to execute.
        program: String,
        /// Description of the exec failure.
        message: String,
    },

    /// Waiting for or reaping the confined process failed.
    #[error("supervision failed: {message}")]
    Wait {
        /// Description of the wait failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl SafeboxError {
    /// Returns a short stage label for logs and CLI output.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Config { .. } => "config",
            Self::Spawn { .. } => "spawn",
            Self::Mapping { .. } => "identity-mapping",
            Self::Mount { .. } => "mount",
            Self::PrivilegeDrop { .. } => "privilege-drop",
            Self::Policy { .. } => "syscall-policy",
            Self::ResourceLimit { .. } => "resource-limit",
            Self::Exec { .. } => "exec",
            Self::Wait { .. } => "wait",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SafeboxError>;

/// A failed confinement step inside the confined process.
///
/// Holds only static text and an errno, so it can be built and sent
/// between `clone(2)` and exec, where the heap must not be touched. The
/// supervisor turns it into a [`SafeboxError`] or a degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepError {
    /// The call or check that failed.
    pub step: &'static str,
    /// `errno` of the failed call; 0 when a check failed instead.
    pub errno: i32,
}

impl StepError {
    /// A call that failed with `errno`.
    #[must_use]
    pub const fn new(step: &'static str, errno: i32) -> Self {
        Self { step, errno }
    }

    /// A call that failed, with the errno left by it on this thread.
    #[must_use]
    pub fn last_os(step: &'static str) -> Self {
        Self::new(step, std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// A post-condition that did not hold.
    #[must_use]
    pub const fn check(step: &'static str) -> Self {
        Self::new(step, 0)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errno == 0 {
            write!(f, "{}", self.step)
        } else {
            write!(
                f,
                "{}: {}",
                self.step,
                std::io::Error::from_raw_os_error(self.errno)
            )
        }
    }
}

impl std::error::Error for StepError {}

/// Result of a step run inside the confined process.
pub type StepResult<T = ()> = std::result::Result<T, StepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_error_names_the_control_file() {
        let err = SafeboxError::Mapping {
            path: PathBuf::from("/proc/42/gid_map"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("/proc/42/gid_map"));
        assert_eq!(err.stage(), "identity-mapping");
    }

    #[test]
    fn step_error_names_call_and_errno() {
        let err = StepError::new("setresuid", 1);
        let text = err.to_string();
        assert!(text.starts_with("setresuid: "), "{text}");
        assert!(text.contains("os error 1"), "{text}");
        assert_eq!(StepError::check("capability check").to_string(), "capability check");
    }

    #[test]
    fn serde_errors_convert() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("nope");
        let err: SafeboxError = parse.unwrap_err().into();
        assert_eq!(err.stage(), "serialization");
    }
}
