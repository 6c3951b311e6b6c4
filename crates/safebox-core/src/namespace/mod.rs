//! Linux namespace management for sandbox isolation.
//!
//! The confined process is created with `clone(2)` so that it is born inside
//! every requested namespace: a new PID namespace only applies to children
//! of the caller, so `unshare(2)` from the supervisor would not make the
//! confined program PID 1 of its own namespace.

pub mod user;
#[cfg(target_os = "linux")]
pub mod uts;

use serde::{Deserialize, Serialize};

use safebox_common::error::{Result, SafeboxError};

/// Which namespace kinds the confined process gets fresh instances of.
///
/// Kinds left `false` are inherited from the supervisor.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceSet {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate network namespace.
    pub network: bool,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            uts: true,
            ipc: true,
            user: false,
            network: false,
        }
    }
}

impl NamespaceSet {
    /// A set requesting no new namespaces.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            pid: false,
            mount: false,
            uts: false,
            ipc: false,
            user: false,
            network: false,
        }
    }

    /// A set requesting every supported namespace kind.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            pid: true,
            mount: true,
            uts: true,
            ipc: true,
            user: true,
            network: true,
        }
    }

    /// Returns the names of the requested kinds, for logging.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        [
            (self.pid, "pid"),
            (self.mount, "mount"),
            (self.uts, "uts"),
            (self.ipc, "ipc"),
            (self.user, "user"),
            (self.network, "network"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }

    /// Translates the set into `clone(2)` flags.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWPID, self.pid);
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWUSER, self.user);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags
    }
}

/// Code that runs as the first thing inside the new namespaces.
///
/// The value is moved into the child; the supervisor's copy is dropped as
/// soon as the child exists, which closes any descriptors it owns on the
/// supervisor side. The returned value becomes the child's exit status if
/// `enter` returns instead of replacing the process image.
///
/// The child is a copy of a possibly multi-threaded process with a single
/// thread left. `enter` must not allocate, free, or log: a lock held by
/// another thread at the time of the copy stays held forever in the child.
pub trait ConfinedEntry {
    /// Runs the in-process entry sequence.
    fn enter(&mut self) -> isize;
}

/// Handle to a process created by [`spawn_confined`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfinedProcess {
    pid: i32,
    namespaces: NamespaceSet,
}

impl ConfinedProcess {
    /// Host-visible process id.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Namespaces the process was created in.
    #[must_use]
    pub const fn namespaces(&self) -> &NamespaceSet {
        &self.namespaces
    }
}

/// Creates a process inside new instances of the requested namespaces and
/// runs `entry` in it.
///
/// The child gets `SIGCHLD` as its termination signal so the supervisor can
/// wait on it like an ordinary child.
///
/// # Errors
///
/// Returns [`SafeboxError::Spawn`] if `clone(2)` fails, typically because
/// the caller lacks the privilege for one of the namespace kinds.
#[cfg(target_os = "linux")]
pub fn spawn_confined<E: ConfinedEntry>(
    namespaces: &NamespaceSet,
    entry: E,
) -> Result<ConfinedProcess> {
    use nix::sched::{CloneCb, clone};

    let flags = namespaces.clone_flags();
    let mut stack = vec![0u8; safebox_common::constants::CHILD_STACK_SIZE];
    let mut entry = entry;
    let callback: CloneCb<'_> = Box::new(move || entry.enter());

    // SAFETY: without CLONE_VM the child runs on a copy-on-write image of
    // this address space, so `stack` stays valid for the child even after
    // it is freed here. The callback only touches values it owns.
    let pid = unsafe { clone(callback, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(|e| {
        SafeboxError::Spawn {
            message: format!("clone({flags:?}) failed: {e}"),
        }
    })?;

    tracing::info!(
        pid = pid.as_raw(),
        namespaces = ?namespaces.kinds(),
        "confined process created"
    );
    Ok(ConfinedProcess {
        pid: pid.as_raw(),
        namespaces: *namespaces,
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn spawn_confined<E: ConfinedEntry>(
    _namespaces: &NamespaceSet,
    _entry: E,
) -> Result<ConfinedProcess> {
    Err(SafeboxError::Config {
        message: "Linux required for native sandbox operations".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_leaves_user_and_network_shared() {
        let set = NamespaceSet::default();
        assert_eq!(set.kinds(), vec!["pid", "mount", "uts", "ipc"]);
    }

    #[test]
    fn none_requests_nothing() {
        assert!(NamespaceSet::none().kinds().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn clone_flags_follow_toggles() {
        use nix::sched::CloneFlags;

        let set = NamespaceSet {
            user: true,
            network: true,
            ..NamespaceSet::none()
        };
        let flags = set.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
        assert_eq!(NamespaceSet::all().clone_flags().bits().count_ones(), 6);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let set: NamespaceSet = serde_json::from_str(r#"{"network": true}"#).unwrap();
        assert!(set.network && set.pid && !set.user);
    }
}
