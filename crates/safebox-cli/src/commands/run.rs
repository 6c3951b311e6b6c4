//! `safebox run`: launch one program inside a sandbox.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use safebox_common::config::SafeboxConfig;
use safebox_common::constants::SETUP_FAILURE_EXIT;
use safebox_common::types::{Enforcement, GroupName};
use safebox_core::namespace::NamespaceSet;
use safebox_core::privilege::DropIdentity;
use safebox_core::seccomp::SeccompPolicy;
use safebox_runtime::spec::{CgroupSelection, SandboxSpec};
use safebox_runtime::supervisor::Supervisor;

use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Memory ceiling, e.g. `256MiB` or a byte count.
    #[arg(long, value_parser = super::parse_memory_arg)]
    pub memory: Option<u64>,

    /// CPU time per period in microseconds.
    #[arg(long)]
    pub cpu_quota: Option<u64>,

    /// CPU period in microseconds.
    #[arg(long, default_value_t = 100_000, requires = "cpu_quota")]
    pub cpu_period: u64,

    /// Join or create this named group instead of a generated one.
    #[arg(long, conflicts_with = "no_cgroup")]
    pub group: Option<String>,

    /// Do not use a resource group at all.
    #[arg(long)]
    pub no_cgroup: bool,

    /// Abort when a resource limit cannot be enforced.
    #[arg(long)]
    pub fail_closed: bool,

    /// Share the host PID namespace.
    #[arg(long)]
    pub no_pid_ns: bool,

    /// Share the host mount namespace (implies no mount operations).
    #[arg(long)]
    pub no_mount_ns: bool,

    /// Share the host UTS namespace.
    #[arg(long)]
    pub no_uts_ns: bool,

    /// Share the host IPC namespace.
    #[arg(long)]
    pub no_ipc_ns: bool,

    /// Run inside a new user namespace.
    #[arg(long)]
    pub user_ns: bool,

    /// Run with an empty network namespace.
    #[arg(long)]
    pub net_ns: bool,

    /// Bind-mount the host binary and library directories.
    #[arg(long)]
    pub bind_host_dirs: bool,

    /// Change the root directory before exec.
    #[arg(long)]
    pub chroot: Option<PathBuf>,

    /// Hostname inside the UTS namespace (overrides the config).
    #[arg(long)]
    pub hostname: Option<String>,

    /// Identity to drop to: an account name or `uid:gid`.
    #[arg(long, value_parser = parse_identity)]
    pub user: Option<DropIdentity>,

    /// Kill the program after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// JSON syscall policy replacing the built-in table.
    #[arg(long)]
    pub seccomp_profile: Option<PathBuf>,

    /// Print the launch report as JSON on stdout.
    #[arg(long)]
    pub json: bool,

    /// Program and its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command.
///
/// The process exit code mirrors the program: its status when it exits,
/// `128 + signal` when a signal kills it, and 126 when the launch fails
/// before the program runs.
///
/// # Errors
///
/// Returns an error if the arguments or the syscall profile are invalid.
pub fn execute(args: RunArgs, config: &SafeboxConfig) -> anyhow::Result<ExitCode> {
    let spec = build_spec(&args, config).context("invalid sandbox settings")?;
    let json = args.json;

    match Supervisor::launch(spec) {
        Ok(report) => {
            for degradation in &report.degradations {
                eprintln!("warning: {degradation}");
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!("{}", output::describe_report(&report));
            }
            let code = report.outcome.shell_code();
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Err(e) => {
            eprintln!("error [{}]: {e}", e.stage());
            Ok(ExitCode::from(
                u8::try_from(SETUP_FAILURE_EXIT).unwrap_or(1),
            ))
        }
    }
}

impl RunArgs {
    fn namespaces(&self) -> NamespaceSet {
        NamespaceSet {
            pid: !self.no_pid_ns,
            mount: !self.no_mount_ns,
            uts: !self.no_uts_ns,
            ipc: !self.no_ipc_ns,
            user: self.user_ns,
            network: self.net_ns,
        }
    }
}

fn build_spec(args: &RunArgs, config: &SafeboxConfig) -> anyhow::Result<SandboxSpec> {
    let (program, rest) = args
        .command
        .split_first()
        .context("a program is required")?;

    let mut builder = SandboxSpec::builder(program)
        .namespaces(args.namespaces())
        .config(config)
        .args(rest.iter().cloned())
        .bind_host_binaries(args.bind_host_dirs);

    if let Some(bytes) = args.memory {
        builder = builder.memory_limit(bytes);
    }
    if let Some(quota) = args.cpu_quota {
        builder = builder.cpu_quota(quota, args.cpu_period);
    }
    if args.no_cgroup {
        builder = builder.cgroup(CgroupSelection::Skip);
    } else if let Some(group) = &args.group {
        builder = builder.cgroup(CgroupSelection::Named(GroupName::new(group.as_str())?));
    }
    if args.fail_closed {
        builder = builder.enforcement(Enforcement::FailClosed);
    }
    if let Some(root) = &args.chroot {
        builder = builder.new_root(root);
    }
    if let Some(hostname) = &args.hostname {
        builder = builder.hostname(hostname);
    }
    if let Some(identity) = &args.user {
        builder = builder.drop_identity(identity.clone());
    }
    if let Some(seconds) = args.timeout {
        builder = builder.timeout(Duration::from_secs(seconds));
    }
    if let Some(profile) = &args.seccomp_profile {
        let policy = SeccompPolicy::from_file(profile)
            .with_context(|| format!("loading syscall profile {}", profile.display()))?;
        builder = builder.policy(policy);
    }

    Ok(builder.build()?)
}

/// Parses `--user`: `uid:gid` for explicit ids, anything else as an account.
fn parse_identity(s: &str) -> Result<DropIdentity, String> {
    match s.split_once(':') {
        Some((uid, gid)) => {
            let uid = uid.parse().map_err(|_| format!("invalid uid in {s:?}"))?;
            let gid = gid.parse().map_err(|_| format!("invalid gid in {s:?}"))?;
            Ok(DropIdentity::Ids { uid, gid })
        }
        None if s.is_empty() => Err("identity must not be empty".to_string()),
        None => Ok(DropIdentity::Account(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    fn run_args(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(["safebox", "run"].iter().chain(argv)).unwrap();
        match cli.command {
            Command::Run(args) => args,
            Command::Cgroup(_) => panic!("expected run"),
        }
    }

    #[test]
    fn identity_accepts_names_and_ids() {
        assert_eq!(
            parse_identity("1000:100"),
            Ok(DropIdentity::Ids { uid: 1000, gid: 100 })
        );
        assert_eq!(
            parse_identity("nobody"),
            Ok(DropIdentity::Account("nobody".into()))
        );
        assert!(parse_identity("1000:x").is_err());
        assert!(parse_identity("").is_err());
    }

    #[test]
    fn namespace_flags_toggle_defaults() {
        let args = run_args(&["--no-pid-ns", "--user-ns", "/bin/true"]);
        let ns = args.namespaces();
        assert!(!ns.pid);
        assert!(ns.mount);
        assert!(ns.user);
        assert!(!ns.network);
    }

    #[test]
    fn flags_flow_into_the_spec() {
        let args = run_args(&[
            "--memory",
            "100MiB",
            "--cpu-quota",
            "50000",
            "--group",
            "g1",
            "--timeout",
            "5",
            "--fail-closed",
            "sh",
            "-c",
            "exit 0",
        ]);
        let spec = build_spec(&args, &SafeboxConfig::default()).unwrap();
        assert_eq!(spec.limits().memory_bytes, Some(100 * 1024 * 1024));
        assert_eq!(spec.limits().cpu.map(|c| c.quota_us), Some(50_000));
        assert_eq!(
            spec.cgroup(),
            &CgroupSelection::Named(GroupName::new("g1").unwrap())
        );
        assert_eq!(spec.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(spec.enforcement(), Enforcement::FailClosed);
        assert_eq!(spec.argv(), ["sh", "-c", "exit 0"]);
        assert_eq!(spec.hostname(), Some("safebox"));
    }

    #[test]
    fn sharing_uts_drops_configured_hostname() {
        let args = run_args(&["--no-uts-ns", "/bin/true"]);
        let spec = build_spec(&args, &SafeboxConfig::default()).unwrap();
        assert_eq!(spec.hostname(), None);
    }

    #[test]
    fn hostname_without_uts_is_rejected() {
        let args = run_args(&["--no-uts-ns", "--hostname", "box", "/bin/true"]);
        assert!(build_spec(&args, &SafeboxConfig::default()).is_err());
    }

    #[test]
    fn missing_profile_is_reported() {
        let args = run_args(&["--seccomp-profile", "/nonexistent/policy.json", "/bin/true"]);
        let err = build_spec(&args, &SafeboxConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/policy.json"));
    }
}
