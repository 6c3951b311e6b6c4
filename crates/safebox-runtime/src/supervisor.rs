//! Host-side orchestration of one sandbox launch.
//!
//! Order of operations:
//!
//! 1. compile the syscall policy and resolve program and identity;
//! 2. create the confined process (it blocks on the release pipe);
//! 3. write the user namespace mapping;
//! 4. create the cgroup, write limits, attach the pid;
//! 5. release the process and collect its entry reports until exec;
//! 6. wait for termination, optionally under a timeout watchdog;
//! 7. decode the exit status and remove the cgroup.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, waitid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use safebox_common::constants::{SUBORDINATE_ID_BASE, SUBORDINATE_ID_RANGE};
use safebox_common::error::{Result, SafeboxError};
use safebox_common::types::{Degradation, DegradationKind, Enforcement, ExitOutcome, GroupName};
use safebox_core::cgroup::{CgroupHandle, ResourceLimiter};
use safebox_core::filesystem::mount::describe_op;
use safebox_core::namespace::spawn_confined;
use safebox_core::namespace::user::{IdentityMapping, write_identity_mapping};
use safebox_core::privilege::{Credentials, PrivilegePlan};

use crate::channel::{self, EntryReport};
use crate::entry::{EntryPlan, ExecImage, SandboxEntry};
use crate::spec::{CgroupSelection, SandboxSpec};

/// Result of a completed launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxReport {
    /// How the program terminated.
    pub outcome: ExitOutcome,
    /// Host pid of the confined process.
    pub pid: i32,
    /// Cgroup the process was attached to, if any.
    pub group: Option<String>,
    /// Whether the timeout watchdog killed the process.
    pub timed_out: bool,
    /// RFC 3339 launch timestamp.
    pub started_at: String,
    /// Confinement steps that were not fully applied.
    pub degradations: Vec<Degradation>,
}

/// Launches sandboxes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Supervisor;

impl Supervisor {
    /// Runs `spec` to completion.
    ///
    /// A program that dies from a signal, including `SIGSYS` from the
    /// syscall filter, is a normal [`ExitOutcome`]; errors are reserved for
    /// setup failures, after which no program ran and any created process
    /// has been reaped.
    ///
    /// Launches may run concurrently from several threads. Every buffer the
    /// confined process uses before exec is built here, before `clone(2)`,
    /// so the confined process never touches the heap or the log
    /// subscriber, whose locks another thread may hold at the moment of the
    /// copy.
    ///
    /// # Errors
    ///
    /// Returns the [`SafeboxError`] of the first fatal setup step.
    pub fn launch(spec: SandboxSpec) -> Result<SandboxReport> {
        let started_at = chrono::Utc::now().to_rfc3339();
        let filter = spec.policy().compile()?;
        let program = resolve_program(&spec)?;
        let credentials = spec.drop_identity().resolve()?;
        let mapping = spec
            .namespaces()
            .user
            .then(|| spec.identity_mapping().copied().unwrap_or_else(|| default_mapping(credentials)));

        let image = ExecImage::new(
            c_string(program.as_os_str().as_encoded_bytes())?,
            spec.argv()
                .iter()
                .map(|arg| c_string(arg.as_bytes()))
                .collect::<Result<_>>()?,
            spec.env()
                .iter()
                .map(|(key, value)| c_string(format!("{key}={value}").as_bytes()))
                .collect::<Result<_>>()?,
        );
        tracing::debug!(
            program = ?image.program(),
            argc = image.argc(),
            envc = image.envc(),
            new_root = ?spec.new_root(),
            uid = credentials.uid,
            gid = credentials.gid,
            "entry plan prepared"
        );
        let plan = EntryPlan {
            mount_plan: spec.mount_plan().clone(),
            hostname: spec.hostname().map(str::to_string),
            privilege: PrivilegePlan {
                new_root: spec.new_root().map(Path::to_path_buf),
                credentials,
                clear_groups: !spec.namespaces().user,
            },
            filter,
            image,
        };

        let (mut supervisor_end, confined_end) = channel::handshake()?;
        let process = spawn_confined(spec.namespaces(), SandboxEntry::new(confined_end, plan))?;
        let pid = process.pid();
        tracing::info!(pid, program = %program.display(), "sandbox launched");

        if let Some(mapping) = mapping {
            if let Err(e) = write_identity_mapping(pid, &mapping) {
                drop(supervisor_end);
                abort(pid);
                return Err(e);
            }
        }

        let mut degradations = Vec::new();
        let group = match join_cgroup(&spec, pid, &mut degradations) {
            Ok(group) => group,
            Err(e) => {
                drop(supervisor_end);
                abort(pid);
                return Err(e);
            }
        };

        if let Err(e) = supervisor_end.release() {
            tracing::warn!(pid, error = %e, "release failed, process already gone");
        }

        let reports = match supervisor_end.collect() {
            Ok(reports) => reports,
            Err(e) => {
                abandon(pid, group, &mut degradations);
                tracing::error!(pid, error = %e, "lost contact with confined process");
                return Err(e);
            }
        };
        let mut failure = None;
        for report in reports {
            match report {
                EntryReport::Degraded {
                    kind,
                    step,
                    errno,
                    op,
                } => {
                    let mut message = channel::step_message(&step, errno);
                    if let Some(op) = op {
                        message = format!("{}: {message}", describe_op(spec.mount_plan(), op));
                    }
                    let degradation = Degradation::new(kind, message);
                    tracing::warn!(pid, %degradation, "confinement degraded");
                    degradations.push(degradation);
                }
                EntryReport::Failed { stage, step, errno } => {
                    let message = channel::step_message(&step, errno);
                    failure = Some(EntryReport::into_error(stage, message, &spec.argv()[0]));
                }
            }
        }
        if let Some(error) = failure {
            if let Err(e) = reap(pid) {
                tracing::debug!(pid, error = %e, "reap after setup failure failed");
            }
            teardown(group, &mut degradations);
            tracing::error!(pid, stage = error.stage(), error = %error, "sandbox setup failed");
            return Err(error);
        }
        tracing::debug!(pid, "confined process reached exec");

        let waited = wait_for_exit(pid, spec.timeout());
        let group_name = group.as_ref().map(|g| g.name().to_string());
        teardown(group, &mut degradations);
        let (outcome, timed_out) = waited?;

        tracing::info!(pid, %outcome, timed_out, "sandbox finished");
        Ok(SandboxReport {
            outcome,
            pid,
            group: group_name,
            timed_out,
            started_at,
            degradations,
        })
    }
}

/// Locates the program on the host, or trusts an absolute path when the
/// program lives under a new root.
fn resolve_program(spec: &SandboxSpec) -> Result<PathBuf> {
    let program = spec.program();
    if spec.new_root().is_some() || program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    which::which_in(program, spec.path_env(), cwd).map_err(|e| SafeboxError::Exec {
        program: program.display().to_string(),
        message: format!("not found in PATH: {e}"),
    })
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| SafeboxError::Config {
        message: format!(
            "argument contains a NUL byte: {:?}",
            String::from_utf8_lossy(bytes)
        ),
    })
}

/// Mapping used when the user namespace is requested without one.
///
/// A root supervisor maps a subordinate range that covers the drop
/// identity; anyone else can only map their own ids, so the drop identity
/// becomes the single mapped id.
fn default_mapping(credentials: Credentials) -> IdentityMapping {
    if nix::unistd::geteuid().is_root() {
        IdentityMapping::subordinate(SUBORDINATE_ID_BASE, SUBORDINATE_ID_RANGE)
    } else {
        IdentityMapping::current_user_as(credentials.uid, credentials.gid)
    }
}

/// Creates the cgroup, writes limits, and attaches `pid`.
///
/// In fail-open mode every failure becomes a degradation; in fail-closed
/// mode the first one aborts the launch.
fn join_cgroup(
    spec: &SandboxSpec,
    pid: i32,
    degradations: &mut Vec<Degradation>,
) -> Result<Option<CgroupHandle>> {
    let name = match spec.cgroup() {
        CgroupSelection::Skip => return Ok(None),
        CgroupSelection::Generated => GroupName::generate(),
        CgroupSelection::Named(name) => name.clone(),
    };
    let enforcement = spec.enforcement();
    let limiter = ResourceLimiter::new(spec.cgroup_root());

    let mut handle = match limiter.create(&name) {
        Ok(handle) => handle,
        Err(e) => {
            degrade(enforcement, Degradation::new(DegradationKind::Attach, e.to_string()), degradations)?;
            return Ok(None);
        }
    };

    for degradation in handle.apply_limits(spec.limits()) {
        if let Err(e) = degrade(enforcement, degradation, degradations) {
            teardown(Some(handle), degradations);
            return Err(e);
        }
    }

    if let Err(e) = handle.attach(pid) {
        let degradation = Degradation::new(DegradationKind::Attach, e.to_string());
        if let Err(e) = degrade(enforcement, degradation, degradations) {
            teardown(Some(handle), degradations);
            return Err(e);
        }
    }
    Ok(Some(handle))
}

fn degrade(
    enforcement: Enforcement,
    degradation: Degradation,
    degradations: &mut Vec<Degradation>,
) -> Result<()> {
    match enforcement {
        Enforcement::FailOpen => {
            tracing::warn!(%degradation, "resource limit not enforced, continuing");
            degradations.push(degradation);
            Ok(())
        }
        Enforcement::FailClosed => Err(SafeboxError::ResourceLimit {
            message: degradation.to_string(),
        }),
    }
}

fn teardown(group: Option<CgroupHandle>, degradations: &mut Vec<Degradation>) {
    if let Some(degradation) = group.and_then(CgroupHandle::teardown) {
        degradations.push(degradation);
    }
}

/// Kills and reaps a confined process whose launch is being abandoned.
fn abort(pid: i32) {
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "kill during abort failed");
    }
    if let Err(e) = reap(pid) {
        tracing::debug!(pid, error = %e, "reap during abort failed");
    }
}

/// Abandons a launch after the group was joined: kills and reaps the
/// process, then removes the group.
fn abandon(pid: i32, group: Option<CgroupHandle>, degradations: &mut Vec<Degradation>) {
    abort(pid);
    teardown(group, degradations);
}

/// Sends `SIGKILL` to the confined process once its deadline passes.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    handle: JoinHandle<bool>,
}

impl Watchdog {
    fn start(pid: i32, timeout: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || match cancelled.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(pid, ?timeout, "timeout reached, killing sandbox");
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    tracing::debug!(pid, error = %e, "watchdog kill failed");
                }
                true
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        });
        Self { cancel, handle }
    }

    /// Stops the watchdog; returns whether it fired.
    fn cancel(self) -> bool {
        let _ = self.cancel.send(());
        self.handle.join().unwrap_or(false)
    }
}

/// Waits for termination without reaping, stops the watchdog, then reaps.
///
/// The pid stays a zombie until the watchdog has been joined, so the
/// watchdog can never signal a recycled pid.
fn wait_for_exit(pid: i32, timeout: Option<Duration>) -> Result<(ExitOutcome, bool)> {
    let watchdog = timeout.map(|timeout| Watchdog::start(pid, timeout));
    let waited = loop {
        match waitid(Id::Pid(Pid::from_raw(pid)), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => {}
            other => break other,
        }
    };
    let timed_out = watchdog.is_some_and(Watchdog::cancel);
    if let Err(e) = waited {
        return Err(SafeboxError::Wait {
            message: format!("waitid({pid}) failed: {e}"),
        });
    }
    let status = reap(pid)?;
    Ok((decode_status(status), timed_out))
}

/// Reaps `pid`, returning its raw wait status.
fn reap(pid: i32) -> Result<i32> {
    loop {
        let mut status = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if rc == pid {
            return Ok(status);
        }
        let errno = Errno::last();
        if errno != Errno::EINTR {
            return Err(SafeboxError::Wait {
                message: format!("waitpid({pid}) failed: {errno}"),
            });
        }
    }
}

/// Translates a raw wait status.
#[must_use]
pub fn decode_status(status: i32) -> ExitOutcome {
    if libc::WIFEXITED(status) {
        ExitOutcome::ExitedNormally(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitOutcome::KilledBySignal(libc::WTERMSIG(status))
    } else {
        ExitOutcome::Unrecognized(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_normal_exit() {
        assert_eq!(decode_status(7 << 8), ExitOutcome::ExitedNormally(7));
        assert_eq!(decode_status(0), ExitOutcome::ExitedNormally(0));
    }

    #[test]
    fn decodes_signal_death() {
        assert_eq!(decode_status(11), ExitOutcome::KilledBySignal(11));
        // Core-dump flag set.
        assert_eq!(decode_status(0x80 | 31), ExitOutcome::KilledBySignal(31));
    }

    #[test]
    fn stopped_status_is_unrecognized() {
        assert_eq!(decode_status(0x137f), ExitOutcome::Unrecognized(0x137f));
    }

    #[test]
    fn bare_names_resolve_against_sandbox_path() {
        let spec = SandboxSpec::builder("sh").build().unwrap();
        let program = resolve_program(&spec).unwrap();
        assert!(program.is_absolute());
        assert!(program.ends_with("sh"));
    }

    #[test]
    fn missing_program_is_an_exec_error() {
        let spec = SandboxSpec::builder("safebox-no-such-program").build().unwrap();
        let err = resolve_program(&spec).unwrap_err();
        assert_eq!(err.stage(), "exec");
    }

    #[test]
    fn fail_closed_turns_degradation_into_error() {
        let mut degradations = Vec::new();
        let degradation = Degradation::new(DegradationKind::MemoryLimit, "EACCES");
        degrade(Enforcement::FailOpen, degradation.clone(), &mut degradations).unwrap();
        assert_eq!(degradations, vec![degradation.clone()]);

        let err = degrade(Enforcement::FailClosed, degradation, &mut degradations).unwrap_err();
        assert_eq!(err.stage(), "resource-limit");
        assert_eq!(degradations.len(), 1);
    }

    #[test]
    fn fake_cgroup_tree_receives_limits_and_pid() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "memory cpu").unwrap();
        let spec = SandboxSpec::builder("/bin/true")
            .cgroup_root(root.path())
            .cgroup(CgroupSelection::Named(GroupName::new("g1").unwrap()))
            .memory_limit(104_857_600)
            .cpu_quota(50_000, 100_000)
            .build()
            .unwrap();

        let mut degradations = Vec::new();
        let handle = join_cgroup(&spec, 4242, &mut degradations).unwrap().unwrap();
        assert!(degradations.is_empty());
        assert!(handle.contains(4242).unwrap());
        assert_eq!(handle.memory_limit().unwrap(), Some(104_857_600));
        let cpu = std::fs::read_to_string(root.path().join("g1/cpu.max")).unwrap();
        assert_eq!(cpu, "50000 100000");
    }

    #[test]
    fn missing_hierarchy_degrades_or_fails() {
        let root = tempfile::tempdir().unwrap();
        let open = SandboxSpec::builder("/bin/true").cgroup_root(root.path()).build().unwrap();
        let mut degradations = Vec::new();
        assert!(join_cgroup(&open, 1, &mut degradations).unwrap().is_none());
        assert_eq!(degradations[0].kind, DegradationKind::Attach);

        let closed = SandboxSpec::builder("/bin/true")
            .cgroup_root(root.path())
            .enforcement(Enforcement::FailClosed)
            .build()
            .unwrap();
        assert!(join_cgroup(&closed, 1, &mut Vec::new()).is_err());
    }

    #[test]
    fn abandoned_launch_leaves_no_zombie_or_group() {
        use nix::sys::wait::{WaitPidFlag, waitpid};
        use nix::unistd::{ForkResult, fork};

        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "memory cpu").unwrap();
        let limiter = ResourceLimiter::new(root.path());
        let handle = limiter.create(&GroupName::new("g1").unwrap()).unwrap();
        let group_dir = handle.path().to_path_buf();

        // SAFETY: the child only blocks in `pause` until it is killed.
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                let _ = nix::unistd::pause();
            },
            ForkResult::Parent { child } => child,
        };

        let mut degradations = Vec::new();
        abandon(child.as_raw(), Some(handle), &mut degradations);
        assert!(degradations.is_empty());
        assert!(!group_dir.exists());
        assert_eq!(
            waitpid(child, Some(WaitPidFlag::WNOHANG)).unwrap_err(),
            Errno::ECHILD
        );
    }

    #[test]
    fn skipped_cgroup_touches_nothing() {
        let spec = SandboxSpec::builder("/bin/true")
            .cgroup(CgroupSelection::Skip)
            .cgroup_root("/nonexistent")
            .build()
            .unwrap();
        let mut degradations = Vec::new();
        assert!(join_cgroup(&spec, 1, &mut degradations).unwrap().is_none());
        assert!(degradations.is_empty());
    }
}
