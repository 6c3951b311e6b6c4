//! Sandbox launch lifecycle for the SafeBox engine.
//!
//! A [`spec::SandboxSpec`] describes one launch. [`supervisor::Supervisor`]
//! turns it into a confined process, drives the host-side setup, releases
//! the process through the [`channel`] handshake, waits for it, and returns
//! a [`supervisor::SandboxReport`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(target_os = "linux")]
pub mod channel;
#[cfg(target_os = "linux")]
mod entry;
#[cfg(target_os = "linux")]
pub mod spec;
#[cfg(target_os = "linux")]
pub mod supervisor;
