//! Supervisor/confined-process handshake.
//!
//! Two close-on-exec pipes connect the flows of one launch:
//!
//! - the **release pipe** carries a single byte from the supervisor once the
//!   identity mapping and cgroup attachment are in place; EOF instead of the
//!   byte means the launch was abandoned;
//! - the **report pipe** carries JSON lines from the confined process
//!   (degradations, or the failure that stopped it). It reaches EOF when the
//!   program image replaces the entry code, because exec closes it.
//!
//! The confined end formats its lines into a stack buffer: it runs between
//! `clone(2)` and exec, where the heap must not be touched.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};

use safebox_common::error::{Result, SafeboxError, StepError};
use safebox_common::types::DegradationKind;

/// Byte written on the release pipe.
const RELEASE: u8 = b'R';

/// Longest report line the confined process sends.
const REPORT_LINE_MAX: usize = 256;

/// Setup stage a confined-process failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    /// Mount isolation.
    Mount,
    /// Privilege drop.
    PrivilegeDrop,
    /// Syscall filter installation.
    Policy,
    /// Program replacement.
    Exec,
}

impl FailureStage {
    /// Wire name, as serde writes it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::PrivilegeDrop => "privilege-drop",
            Self::Policy => "policy",
            Self::Exec => "exec",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record sent by the confined process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryReport {
    /// A step was skipped or only partly applied.
    Degraded {
        /// What was not enforced.
        kind: DegradationKind,
        /// The call that failed.
        step: String,
        /// Its errno.
        errno: i32,
        /// Index of the mount operation, for bind mount failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<usize>,
    },
    /// A mandatory step failed; the process exits without running the
    /// program.
    Failed {
        /// Where the failure happened.
        stage: FailureStage,
        /// The call or check that failed.
        step: String,
        /// Its errno; 0 for a failed check.
        errno: i32,
    },
}

impl EntryReport {
    /// Converts a failure record into the supervisor-side error.
    #[must_use]
    pub fn into_error(stage: FailureStage, message: String, program: &str) -> SafeboxError {
        match stage {
            FailureStage::Mount => SafeboxError::Mount { message },
            FailureStage::PrivilegeDrop => SafeboxError::PrivilegeDrop { message },
            FailureStage::Policy => SafeboxError::Policy { message },
            FailureStage::Exec => SafeboxError::Exec {
                program: program.to_string(),
                message,
            },
        }
    }
}

/// Renders a reported step the way [`StepError`] displays.
#[must_use]
pub fn step_message(step: &str, errno: i32) -> String {
    if errno == 0 {
        step.to_string()
    } else {
        format!("{step}: {}", std::io::Error::from_raw_os_error(errno))
    }
}

/// Supervisor side of the handshake.
#[derive(Debug)]
pub struct SupervisorEnd {
    release: File,
    report: File,
}

/// Confined-process side of the handshake.
#[derive(Debug)]
pub struct ConfinedEnd {
    release: File,
    report: File,
    foreign: [RawFd; 2],
}

/// Creates both pipes.
///
/// # Errors
///
/// Returns [`SafeboxError::Spawn`] if `pipe2(2)` fails.
pub fn handshake() -> Result<(SupervisorEnd, ConfinedEnd)> {
    let (release_rx, release_tx) = pipe()?;
    let (report_rx, report_tx) = pipe()?;
    let foreign = [release_tx.as_raw_fd(), report_rx.as_raw_fd()];
    Ok((
        SupervisorEnd {
            release: File::from(release_tx),
            report: File::from(report_rx),
        },
        ConfinedEnd {
            release: File::from(release_rx),
            report: File::from(report_tx),
            foreign,
        },
    ))
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| SafeboxError::Spawn {
        message: format!("pipe2 failed: {e}"),
    })
}

impl SupervisorEnd {
    /// Lets the confined process continue past the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::Spawn`] if the confined process is gone.
    pub fn release(&mut self) -> Result<()> {
        self.release
            .write_all(&[RELEASE])
            .map_err(|e| SafeboxError::Spawn {
                message: format!("releasing confined process failed: {e}"),
            })
    }

    /// Reads reports until the confined process execs or exits.
    ///
    /// Unparseable lines are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the pipe fails.
    pub fn collect(self) -> Result<Vec<EntryReport>> {
        drop(self.release);
        let mut reports = Vec::new();
        for line in BufReader::new(self.report).lines() {
            let line = line.map_err(|e| SafeboxError::Wait {
                message: format!("reading entry reports failed: {e}"),
            })?;
            match serde_json::from_str(&line) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(line, error = %e, "malformed entry report"),
            }
        }
        Ok(reports)
    }
}

impl ConfinedEnd {
    /// Closes the supervisor's descriptors inherited by the confined
    /// process, so EOF on either pipe reflects the peer's state.
    pub fn close_foreign(&mut self) {
        for fd in self.foreign {
            // SAFETY: both descriptors belong to the supervisor's `File`s,
            // which are never dropped in this process image.
            let _ = unsafe { libc::close(fd) };
        }
    }

    /// Blocks until the supervisor releases or abandons the launch.
    ///
    /// Returns `false` if the release pipe closed without the byte.
    #[must_use]
    pub fn wait_for_release(&mut self) -> bool {
        let mut byte = [0u8; 1];
        loop {
            match self.release.read(&mut byte) {
                Ok(1) => return byte[0] == RELEASE,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Ok(_) | Err(_) => return false,
            }
        }
    }

    /// Reports a step that was skipped; the launch continues.
    pub fn report_degraded(&mut self, kind: DegradationKind, error: StepError, op: Option<usize>) {
        match op {
            Some(op) => self.send(format_args!(
                r#"{{"type":"degraded","kind":"{kind}","step":"{}","errno":{},"op":{op}}}"#,
                error.step, error.errno
            )),
            None => self.send(format_args!(
                r#"{{"type":"degraded","kind":"{kind}","step":"{}","errno":{}}}"#,
                error.step, error.errno
            )),
        }
    }

    /// Reports the failure that stops the launch.
    pub fn report_failed(&mut self, stage: FailureStage, error: StepError) {
        self.send(format_args!(
            r#"{{"type":"failed","stage":"{stage}","step":"{}","errno":{}}}"#,
            error.step, error.errno
        ));
    }

    /// Writes one line through a stack buffer. Delivery failures are
    /// ignored: the supervisor also learns the outcome from the exit status.
    fn send(&mut self, args: fmt::Arguments<'_>) {
        let mut line = [0u8; REPORT_LINE_MAX];
        let mut cursor: &mut [u8] = &mut line;
        if cursor.write_fmt(args).is_err() || cursor.write_all(b"\n").is_err() {
            return;
        }
        let len = REPORT_LINE_MAX - cursor.len();
        let _ = self.report.write_all(&line[..len]);
    }
}
