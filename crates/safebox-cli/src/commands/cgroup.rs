//! `safebox cgroup`: operator access to resource groups.
//!
//! Each action reports failure through its own exit code so scripts can
//! tell the causes apart.

use std::process::ExitCode;

use clap::{Args, Subcommand};
use safebox_common::config::SafeboxConfig;
use safebox_common::types::{CpuQuota, GroupName};
use safebox_core::cgroup::{CgroupHandle, ResourceLimiter};

use crate::output::format_bytes;

/// Bad group name or argument.
const EXIT_USAGE: u8 = 1;
/// The group directory could not be created.
const EXIT_CREATE: u8 = 2;
/// The group does not exist.
const EXIT_MISSING: u8 = 3;
/// `cgroup.procs` rejected the pid.
const EXIT_ATTACH: u8 = 4;
/// The memory limit file rejected the value.
const EXIT_MEMORY: u8 = 5;
/// `cpu.max` rejected the value.
const EXIT_CPU: u8 = 6;

/// Arguments for the `cgroup` command.
#[derive(Args, Debug)]
pub struct CgroupArgs {
    /// Action to perform.
    #[command(subcommand)]
    pub action: CgroupAction,
}

/// Resource group actions.
#[derive(Subcommand, Debug)]
pub enum CgroupAction {
    /// Create a group (an existing one is reused).
    Create {
        /// Group name.
        group: String,
    },
    /// Move a process into an existing group.
    Attach {
        /// Group name.
        group: String,
        /// Process id.
        pid: i32,
    },
    /// Set the memory ceiling of an existing group.
    #[command(name = "mem.set")]
    MemSet {
        /// Group name.
        group: String,
        /// Limit, e.g. `104857600` or `100MiB`.
        #[arg(value_parser = super::parse_memory_arg)]
        bytes: u64,
    },
    /// Set the CPU bandwidth of an existing group.
    #[command(name = "cpu.set")]
    CpuSet {
        /// Group name.
        group: String,
        /// CPU time per period in microseconds.
        quota: u64,
        /// Period in microseconds.
        period: u64,
    },
}

impl CgroupAction {
    fn group(&self) -> &str {
        match self {
            Self::Create { group }
            | Self::Attach { group, .. }
            | Self::MemSet { group, .. }
            | Self::CpuSet { group, .. } => group,
        }
    }
}

/// Executes the `cgroup` command against the configured cgroup root.
pub fn execute(args: CgroupArgs, config: &SafeboxConfig) -> ExitCode {
    let limiter = ResourceLimiter::new(&config.cgroup_root);
    match run(&limiter, &args.action) {
        Ok(message) => {
            println!("{message}");
            ExitCode::SUCCESS
        }
        Err((code, message)) => {
            eprintln!("error: {message}");
            ExitCode::from(code)
        }
    }
}

type Outcome = Result<String, (u8, String)>;

fn run(limiter: &ResourceLimiter, action: &CgroupAction) -> Outcome {
    let name = GroupName::new(action.group()).map_err(|e| (EXIT_USAGE, e.to_string()))?;

    match action {
        CgroupAction::Create { .. } => {
            let handle = limiter
                .create(&name)
                .map_err(|e| (EXIT_CREATE, e.to_string()))?;
            Ok(format!("group {name} ready at {}", handle.path().display()))
        }
        CgroupAction::Attach { pid, .. } => {
            let mut handle = open(limiter, &name)?;
            handle.attach(*pid).map_err(|e| (EXIT_ATTACH, e.to_string()))?;
            Ok(format!("pid {pid} attached to {name}"))
        }
        CgroupAction::MemSet { bytes, .. } => {
            let handle = open(limiter, &name)?;
            handle
                .set_memory_limit(*bytes)
                .map_err(|e| (EXIT_MEMORY, e.to_string()))?;
            Ok(format!("memory limit of {name} set to {}", format_bytes(*bytes)))
        }
        CgroupAction::CpuSet { quota, period, .. } => {
            let handle = open(limiter, &name)?;
            handle
                .set_cpu_quota(CpuQuota {
                    quota_us: *quota,
                    period_us: *period,
                })
                .map_err(|e| (EXIT_CPU, e.to_string()))?;
            Ok(format!("CPU quota of {name} set to {quota}/{period} us"))
        }
    }
}

fn open(limiter: &ResourceLimiter, name: &GroupName) -> Result<CgroupHandle, (u8, String)> {
    limiter.open(name).map_err(|e| (EXIT_MISSING, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_v2() -> (tempfile::TempDir, ResourceLimiter) {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "memory cpu").unwrap();
        let limiter = ResourceLimiter::new(root.path());
        (root, limiter)
    }

    fn code(outcome: Outcome) -> u8 {
        outcome.map_or_else(|(code, _)| code, |_| 0)
    }

    #[test]
    fn create_then_set_memory() {
        let (root, limiter) = fake_v2();
        let create = CgroupAction::Create { group: "g1".into() };
        assert_eq!(code(run(&limiter, &create)), 0);

        let set = CgroupAction::MemSet {
            group: "g1".into(),
            bytes: 104_857_600,
        };
        let message = run(&limiter, &set).unwrap();
        assert!(message.ends_with("100.0 MiB"));
        let written = std::fs::read_to_string(root.path().join("g1/memory.max")).unwrap();
        assert_eq!(written, "104857600");
    }

    #[test]
    fn actions_on_missing_group_exit_3() {
        let (_root, limiter) = fake_v2();
        let attach = CgroupAction::Attach {
            group: "absent".into(),
            pid: 1,
        };
        assert_eq!(code(run(&limiter, &attach)), EXIT_MISSING);
    }

    #[test]
    fn create_without_hierarchy_exits_2() {
        let root = tempfile::tempdir().unwrap();
        let limiter = ResourceLimiter::new(root.path());
        let create = CgroupAction::Create { group: "g1".into() };
        assert_eq!(code(run(&limiter, &create)), EXIT_CREATE);
    }

    #[test]
    fn invalid_name_is_a_usage_error() {
        let (_root, limiter) = fake_v2();
        let create = CgroupAction::Create { group: "../escape".into() };
        assert_eq!(code(run(&limiter, &create)), EXIT_USAGE);
    }

    #[test]
    fn zero_cpu_quota_exits_6() {
        let (_root, limiter) = fake_v2();
        let _ = run(&limiter, &CgroupAction::Create { group: "g1".into() }).unwrap();
        let set = CgroupAction::CpuSet {
            group: "g1".into(),
            quota: 0,
            period: 100_000,
        };
        assert_eq!(code(run(&limiter, &set)), EXIT_CPU);
    }

    #[test]
    fn attach_writes_pid() {
        let (root, limiter) = fake_v2();
        let _ = run(&limiter, &CgroupAction::Create { group: "g1".into() }).unwrap();
        let attach = CgroupAction::Attach {
            group: "g1".into(),
            pid: 4242,
        };
        assert_eq!(code(run(&limiter, &attach)), 0);
        let procs = std::fs::read_to_string(root.path().join("g1/cgroup.procs")).unwrap();
        assert_eq!(procs, "4242");
    }
}
