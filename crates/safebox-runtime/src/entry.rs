//! Code run inside the confined process between `clone(2)` and exec.
//!
//! Nothing here allocates, frees, or logs. Another supervisor thread may
//! have held an allocator or logging lock at the instant of `clone(2)`, and
//! the copy of that lock in the confined process is never released. Every
//! buffer the entry needs is built beforehand by the supervisor.

use std::ffi::{CStr, CString, c_char};
use std::ptr;

use safebox_common::constants::SETUP_FAILURE_EXIT;
use safebox_common::error::StepError;
use safebox_common::types::DegradationKind;
use safebox_core::filesystem::mount::{MountPlan, isolate};
use safebox_core::namespace::ConfinedEntry;
use safebox_core::privilege::{PrivilegePlan, drop_privileges};
use safebox_core::seccomp::CompiledFilter;

use crate::channel::{ConfinedEnd, FailureStage};

/// Program image handed to `execve(2)`, with its null-terminated pointer
/// arrays built ahead of time.
#[derive(Debug)]
pub(crate) struct ExecImage {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
}

impl ExecImage {
    pub(crate) fn new(program: CString, argv: Vec<CString>, envp: Vec<CString>) -> Self {
        let argv_ptrs = pointer_array(&argv);
        let envp_ptrs = pointer_array(&envp);
        Self {
            program,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
        }
    }

    pub(crate) fn program(&self) -> &CStr {
        &self.program
    }

    pub(crate) fn argc(&self) -> usize {
        self.argv.len()
    }

    pub(crate) fn envc(&self) -> usize {
        self.envp.len()
    }

    /// Replaces the process image; returns only on failure.
    fn exec(&self) -> StepError {
        // SAFETY: both arrays are null-terminated and point into the
        // `CString`s owned by `self`, which outlive the call.
        let _ = unsafe {
            libc::execve(
                self.program.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            )
        };
        StepError::last_os("execve")
    }
}

fn pointer_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Everything the confined process needs, prepared by the supervisor.
#[derive(Debug)]
pub(crate) struct EntryPlan {
    pub mount_plan: MountPlan,
    pub hostname: Option<String>,
    pub privilege: PrivilegePlan,
    pub filter: CompiledFilter,
    pub image: ExecImage,
}

/// The confined process's entry: handshake, mounts, hostname, privilege
/// drop, syscall filter, exec. Nothing else runs in between.
#[derive(Debug)]
pub(crate) struct SandboxEntry {
    channel: ConfinedEnd,
    plan: EntryPlan,
}

impl SandboxEntry {
    pub(crate) const fn new(channel: ConfinedEnd, plan: EntryPlan) -> Self {
        Self { channel, plan }
    }

    /// Runs every step; on success the process image is gone.
    fn run(channel: &mut ConfinedEnd, plan: &EntryPlan) -> (FailureStage, StepError) {
        if let Err(e) = isolate(&plan.mount_plan, |index, e| {
            channel.report_degraded(DegradationKind::BindMount, e, Some(index));
        }) {
            return (FailureStage::Mount, e);
        }

        if let Some(hostname) = &plan.hostname {
            if let Err(e) = safebox_core::namespace::uts::set_hostname(hostname) {
                channel.report_degraded(DegradationKind::Hostname, e, None);
            }
        }

        if let Err(e) = drop_privileges(&plan.privilege) {
            return (FailureStage::PrivilegeDrop, e);
        }
        if let Err(e) = plan.filter.load() {
            return (FailureStage::Policy, e);
        }
        (FailureStage::Exec, plan.image.exec())
    }
}

impl ConfinedEntry for SandboxEntry {
    fn enter(&mut self) -> isize {
        let Self { channel, plan } = self;
        channel.close_foreign();
        if !channel.wait_for_release() {
            return SETUP_FAILURE_EXIT as isize;
        }
        let (stage, error) = Self::run(channel, plan);
        channel.report_failed(stage, error);
        SETUP_FAILURE_EXIT as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn pointer_arrays_are_null_terminated() {
        let image = ExecImage::new(c("/bin/sh"), vec![c("sh"), c("-c")], vec![c("A=1")]);
        assert_eq!(image.argv_ptrs.len(), 3);
        assert!(image.argv_ptrs[2].is_null());
        assert_eq!(image.envp_ptrs.len(), 2);
        assert!(image.envp_ptrs[1].is_null());
        assert_eq!(image.argv_ptrs[0], image.argv[0].as_ptr());
        assert_eq!((image.argc(), image.envc()), (2, 1));
    }

    #[test]
    fn moving_the_image_keeps_pointers_valid() {
        let image = ExecImage::new(c("/bin/true"), vec![c("true")], Vec::new());
        let before = image.argv_ptrs[0];
        let moved = Box::new(image);
        assert_eq!(moved.argv_ptrs[0], before);
        // SAFETY: the pointer targets the `CString` heap buffer owned by `moved`.
        let arg = unsafe { CStr::from_ptr(moved.argv_ptrs[0]) };
        assert_eq!(arg.to_str().unwrap(), "true");
    }

    #[test]
    fn exec_of_missing_program_reports_enoent() {
        let image = ExecImage::new(c("/nonexistent/safebox-program"), vec![c("x")], Vec::new());
        let err = image.exec();
        assert_eq!(err.step, "execve");
        assert_eq!(err.errno, libc::ENOENT);
    }
}
