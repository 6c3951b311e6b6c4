//! Default-deny syscall filtering.
//!
//! A [`SeccompPolicy`] is a plain data table of `(syscall, action)` rules plus
//! a fallback action. It is validated and compiled to a classic BPF program
//! by the supervisor, before the confined process exists; the confined
//! process only loads the finished [`CompiledFilter`], as the last step
//! before exec.

mod bpf;
pub mod table;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use safebox_common::error::{Result, SafeboxError, StepError, StepResult};

use self::table::Lookup;

/// Largest errno value the kernel treats as an error return.
const MAX_ERRNO: u32 = 4095;

static FILTER_LOADED: AtomicBool = AtomicBool::new(false);

/// What happens when a syscall matches a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyscallAction {
    /// Let the syscall run.
    Allow,
    /// Fail the syscall with the given errno.
    Errno(u32),
    /// Let the syscall run and record it in the audit log.
    Log,
    /// Deliver `SIGSYS` to the calling thread.
    Trap,
    /// Kill the whole process with `SIGSYS`.
    #[default]
    #[serde(rename = "kill")]
    KillProcess,
}

impl SyscallAction {
    const fn ret_value(self) -> u32 {
        match self {
            Self::Allow => bpf::RET_ALLOW,
            Self::Errno(errno) => bpf::RET_ERRNO | (errno & bpf::RET_DATA_MASK),
            Self::Log => bpf::RET_LOG,
            Self::Trap => bpf::RET_TRAP,
            Self::KillProcess => bpf::RET_KILL_PROCESS,
        }
    }
}

impl fmt::Display for SyscallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Errno(errno) => write!(f, "errno({errno})"),
            Self::Log => write!(f, "log"),
            Self::Trap => write!(f, "trap"),
            Self::KillProcess => write!(f, "kill"),
        }
    }
}

/// One `(syscall, action)` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyscallRule {
    /// Syscall name, as in `<asm/unistd.h>` without the `__NR_` prefix.
    pub syscall: String,
    /// Action taken when the syscall is made.
    pub action: SyscallAction,
}

impl SyscallRule {
    /// Creates a rule.
    pub fn new(syscall: impl Into<String>, action: SyscallAction) -> Self {
        Self {
            syscall: syscall.into(),
            action,
        }
    }
}

/// Declarative syscall policy.
///
/// ```json
/// {"default": "kill", "rules": [{"syscall": "read", "action": "allow"},
///                              {"syscall": "reboot", "action": {"errno": 1}}]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeccompPolicy {
    /// Action for every syscall no rule names.
    #[serde(default)]
    pub default: SyscallAction,
    /// Rules, matched by syscall number.
    pub rules: Vec<SyscallRule>,
}

impl Default for SeccompPolicy {
    /// The built-in policy: kill on anything unlisted, allow ordinary
    /// userspace work, and deny or trap the administrative syscalls.
    fn default() -> Self {
        let mut rules: Vec<SyscallRule> = table::DEFAULT_ALLOWED
            .iter()
            .map(|name| SyscallRule::new(*name, SyscallAction::Allow))
            .collect();
        rules.extend(
            table::default_special_rules()
                .into_iter()
                .map(|(name, action)| SyscallRule::new(name, action)),
        );
        Self {
            default: SyscallAction::KillProcess,
            rules,
        }
    }
}

impl SeccompPolicy {
    /// Creates a policy from explicit parts.
    #[must_use]
    pub const fn new(default: SyscallAction, rules: Vec<SyscallRule>) -> Self {
        Self { default, rules }
    }

    /// Parses a policy from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not describe a policy.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON policy file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SafeboxError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let policy = Self::from_json(&content)?;
        tracing::debug!(path = %path.display(), rules = policy.rules.len(), "seccomp profile loaded");
        Ok(policy)
    }

    /// Returns the action configured for `syscall`, if any rule names it.
    #[must_use]
    pub fn action_for(&self, syscall: &str) -> Option<SyscallAction> {
        self.rules
            .iter()
            .find(|rule| rule.syscall == syscall)
            .map(|rule| rule.action)
    }

    /// Sets the action for `syscall`, replacing an existing rule.
    #[must_use]
    pub fn with_rule(mut self, syscall: &str, action: SyscallAction) -> Self {
        match self.rules.iter_mut().find(|rule| rule.syscall == syscall) {
            Some(rule) => rule.action = action,
            None => self.rules.push(SyscallRule::new(syscall, action)),
        }
        self
    }

    /// Removes every rule for `syscall`, so it falls through to the default.
    #[must_use]
    pub fn without(mut self, syscall: &str) -> Self {
        self.rules.retain(|rule| rule.syscall != syscall);
        self
    }

    /// Checks the table and resolves it to `(number, return value)` pairs.
    ///
    /// Names unknown to this architecture are skipped when another
    /// supported architecture has them; any other unknown name, a repeated
    /// name, or an out-of-range errno is an error.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::Policy`] describing the first bad rule.
    pub fn validate(&self) -> Result<Vec<(u32, u32)>> {
        if let SyscallAction::Errno(errno) = self.default {
            check_errno("default", errno)?;
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if !seen.insert(rule.syscall.as_str()) {
                return Err(SafeboxError::Policy {
                    message: format!("syscall {} appears more than once", rule.syscall),
                });
            }
            if let SyscallAction::Errno(errno) = rule.action {
                check_errno(&rule.syscall, errno)?;
            }
            match table::resolve_syscall(&rule.syscall) {
                Lookup::Number(nr) => {
                    let nr = u32::try_from(nr).map_err(|_| SafeboxError::Policy {
                        message: format!("syscall {} has number {nr}", rule.syscall),
                    })?;
                    resolved.push((nr, rule.action.ret_value()));
                }
                Lookup::Absent => {
                    tracing::debug!(syscall = %rule.syscall, "syscall not present on this architecture, skipped");
                }
                Lookup::Unknown => {
                    return Err(SafeboxError::Policy {
                        message: format!("unknown syscall {:?}", rule.syscall),
                    });
                }
            }
        }
        Ok(resolved)
    }

    /// Validates the policy and assembles its BPF program.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::Policy`] if validation fails or the program
    /// exceeds the kernel's instruction limit.
    pub fn compile(&self) -> Result<CompiledFilter> {
        let resolved = self.validate()?;
        let program = bpf::assemble(&resolved, self.default.ret_value());
        if program.len() > bpf::MAX_INSTRUCTIONS {
            return Err(SafeboxError::Policy {
                message: format!(
                    "filter needs {} instructions, the kernel allows {}",
                    program.len(),
                    bpf::MAX_INSTRUCTIONS
                ),
            });
        }
        tracing::debug!(
            rules = resolved.len(),
            instructions = program.len(),
            default = %self.default,
            "seccomp filter compiled"
        );
        Ok(CompiledFilter {
            program,
            rules: resolved.len(),
        })
    }
}

fn check_errno(target: &str, errno: u32) -> Result<()> {
    if errno > MAX_ERRNO {
        return Err(SafeboxError::Policy {
            message: format!("errno {errno} for {target} is out of range"),
        });
    }
    Ok(())
}

/// A validated, assembled filter ready to be loaded.
pub struct CompiledFilter {
    program: Vec<libc::sock_filter>,
    rules: usize,
}

impl fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("instructions", &self.program.len())
            .field("rules", &self.rules)
            .finish()
    }
}

impl CompiledFilter {
    /// Number of BPF instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.program.len()
    }

    /// Whether the program is empty; never true for an assembled filter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Number of rules that made it into the program.
    #[must_use]
    pub const fn rule_count(&self) -> usize {
        self.rules
    }

    /// Installs the filter on the calling process.
    ///
    /// Requires `no_new_privs` (or `CAP_SYS_ADMIN`). The filter is
    /// inherited across `execve(2)` and cannot be removed. A process loads
    /// at most one filter through this type. Borrows the program so that
    /// nothing is freed between `clone(2)` and exec.
    ///
    /// # Errors
    ///
    /// Returns `EBUSY` if a filter was already loaded, or the `prctl(2)`
    /// failure.
    pub fn load(&self) -> StepResult {
        let len = u16::try_from(self.program.len())
            .map_err(|_| StepError::new("PR_SET_SECCOMP", libc::E2BIG))?;
        if FILTER_LOADED.swap(true, Ordering::SeqCst) {
            return Err(StepError::new("loading a second filter", libc::EBUSY));
        }
        let prog = libc::sock_fprog {
            len,
            filter: self.program.as_ptr().cast_mut(),
        };
        // SAFETY: `prog` points at `self.program`, which outlives the call;
        // the kernel copies the program before returning.
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &raw const prog,
            )
        };
        if rc != 0 {
            let err = StepError::last_os("PR_SET_SECCOMP");
            FILTER_LOADED.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }
}
