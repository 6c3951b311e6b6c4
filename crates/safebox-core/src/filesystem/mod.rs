//! Filesystem isolation for the confined process.
//!
//! Provides private mount propagation, a fresh `/proc`, host bind mounts,
//! and the `chroot` switch applied during the privilege drop.

pub mod mount;
pub mod root;
