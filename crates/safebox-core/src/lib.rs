//! # safebox-core
//!
//! Low-level Linux isolation primitives for the SafeBox engine.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: creating the confined process inside new PID, mount,
//!   UTS, IPC, user, and network namespaces, and mapping its identity.
//! - **Filesystem**: private mount propagation, a fresh `/proc`, host bind
//!   mounts, and `chroot`.
//! - **Privileges**: `no_new_privs`, the gid-then-uid drop, and emptied
//!   capability sets.
//! - **Seccomp**: a declarative default-deny syscall table compiled to BPF.
//! - **Cgroups**: v1/v2 detection, memory and CPU limits, membership.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
#[cfg(target_os = "linux")]
pub mod filesystem;
pub mod namespace;
#[cfg(target_os = "linux")]
pub mod privilege;
#[cfg(target_os = "linux")]
pub mod seccomp;
