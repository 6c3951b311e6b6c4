//! Domain primitive types used across the SafeBox workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SafeboxError};

/// Name of a resource group (cgroup directory) owned by one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupName(String);

impl GroupName {
    /// Creates a group name from a caller-supplied value.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, is `.`/`..`, or contains a
    /// path separator, since it becomes a single directory component.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(SafeboxError::Config {
                message: format!("invalid cgroup name: {name:?}"),
            });
        }
        Ok(Self(name))
    }

    /// Generates a per-invocation group name from a random token.
    #[must_use]
    pub fn generate() -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}",
            crate::constants::GROUP_PREFIX,
            &token[..crate::constants::GROUP_TOKEN_LEN]
        ))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU bandwidth limit: `quota_us` of CPU time per `period_us` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuQuota {
    /// Allowed CPU time per period, in microseconds.
    pub quota_us: u64,
    /// Length of the accounting period, in microseconds.
    pub period_us: u64,
}

/// Resource limits for a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU quota/period pair.
    pub cpu: Option<CpuQuota>,
}

impl ResourceLimits {
    /// Returns whether any limit is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu.is_none()
    }
}

/// How the sandbox reacts when a resource limit cannot be enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Enforcement {
    /// Log the failure and run the program with reduced confinement.
    #[default]
    FailOpen,
    /// Abort the launch.
    FailClosed,
}

/// How the confined process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// The program exited with a status code.
    ExitedNormally(i32),
    /// The program was terminated by a signal.
    KilledBySignal(i32),
    /// The kernel reported a status that is neither of the above.
    Unrecognized(i32),
}

impl ExitOutcome {
    /// Maps the outcome onto a shell-style exit code.
    ///
    /// Signal deaths become `128 + signal`, as shells report them.
    #[must_use]
    pub const fn shell_code(&self) -> i32 {
        match *self {
            Self::ExitedNormally(code) => code,
            Self::KilledBySignal(signal) => 128 + signal,
            Self::Unrecognized(_) => 1,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitedNormally(code) => write!(f, "exited with code {code}"),
            Self::KilledBySignal(signal) => write!(f, "killed by signal {signal}"),
            Self::Unrecognized(raw) => write!(f, "ended with status {raw:#x}"),
        }
    }
}

/// Category of a non-fatal confinement failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradationKind {
    /// An optional bind mount could not be created.
    BindMount,
    /// The hostname inside the UTS namespace could not be set.
    Hostname,
    /// The memory ceiling could not be written.
    MemoryLimit,
    /// The CPU quota could not be written.
    CpuLimit,
    /// The confined process could not be attached to its group.
    Attach,
    /// The group directory could not be removed.
    Teardown,
}

impl fmt::Display for DegradationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindMount => write!(f, "bind-mount"),
            Self::Hostname => write!(f, "hostname"),
            Self::MemoryLimit => write!(f, "memory-limit"),
            Self::CpuLimit => write!(f, "cpu-limit"),
            Self::Attach => write!(f, "attach"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// A surfaced warning: the launch proceeded with reduced guarantees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    /// What was not enforced.
    pub kind: DegradationKind,
    /// Human-readable cause.
    pub message: String,
}

impl Degradation {
    /// Creates a degradation record.
    #[must_use]
    pub fn new(kind: DegradationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Parses memory strings like "128MiB", "256MB", "1GiB" into bytes.
#[allow(clippy::option_if_let_else)]
pub fn parse_memory(s: &str) -> Option<u64> {
    let s = s.trim();
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("GiB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("GB") {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix("MiB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix("KiB") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1000)
    } else {
        (s, 1)
    };
    num_str.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}
