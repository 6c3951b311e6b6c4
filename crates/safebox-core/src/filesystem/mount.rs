//! Mount isolation inside the confined process.
//!
//! Runs before any other in-process step: it makes the inherited mount tree
//! private, gives the new PID namespace its own `/proc`, and optionally
//! bind-mounts host binary and library directories.

use std::path::{Path, PathBuf};

use nix::mount::{MsFlags, mount};
use serde::{Deserialize, Serialize};

use safebox_common::error::{Result, SafeboxError, StepError, StepResult};

/// One step of a [`MountPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum MountOp {
    /// Recursively set `/` to private propagation.
    MakePrivate,
    /// Mount a fresh procfs at `target`.
    MountProc {
        /// Mount point, usually `/proc`.
        target: PathBuf,
    },
    /// Recursively bind-mount `source` onto `target`.
    Bind {
        /// Host directory.
        source: PathBuf,
        /// Mount point inside the sandbox view.
        target: PathBuf,
    },
}

/// Ordered mount operations applied inside the mount namespace.
///
/// `MakePrivate` always precedes every operation that creates a mount, so
/// no mount made by the sandbox propagates back to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MountOp>", into = "Vec<MountOp>")]
pub struct MountPlan {
    ops: Vec<MountOp>,
}

impl MountPlan {
    /// A plan that performs no mount operation.
    #[must_use]
    pub const fn empty() -> Self {
        Self { ops: Vec::new() }
    }

    /// Private propagation followed by a fresh `/proc` under `root`
    /// (the current root when `None`).
    #[must_use]
    pub fn standard(root: Option<&Path>) -> Self {
        Self {
            ops: vec![
                MountOp::MakePrivate,
                MountOp::MountProc {
                    target: reanchor(root, Path::new("/proc")),
                },
            ],
        }
    }

    /// Builds a plan from explicit operations.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount-creating operation precedes `MakePrivate`.
    pub fn from_ops(ops: Vec<MountOp>) -> Result<Self> {
        let plan = Self { ops };
        plan.validate()?;
        Ok(plan)
    }

    /// Appends bind mounts of the host binary and library directories that
    /// exist on this host, re-anchored under `root` when one is given.
    #[must_use]
    pub fn with_host_binaries(mut self, root: Option<&Path>) -> Self {
        if !self.ops.contains(&MountOp::MakePrivate) {
            self.ops.insert(0, MountOp::MakePrivate);
        }
        for dir in safebox_common::constants::HOST_BIND_DIRS {
            let source = Path::new(dir);
            if source.is_dir() {
                self.ops.push(MountOp::Bind {
                    source: source.to_path_buf(),
                    target: reanchor(root, source),
                });
            }
        }
        self
    }

    /// Checks the ordering invariant.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first operation that would create a mount
    /// while propagation is still shared with the host.
    pub fn validate(&self) -> Result<()> {
        let mut private = false;
        for op in &self.ops {
            match op {
                MountOp::MakePrivate => private = true,
                MountOp::MountProc { .. } | MountOp::Bind { .. } if !private => {
                    return Err(SafeboxError::Config {
                        message: format!("mount plan: {op:?} precedes make-private"),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns the operations in execution order.
    #[must_use]
    pub fn ops(&self) -> &[MountOp] {
        &self.ops
    }

    /// Returns whether the plan performs no operation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Default for MountPlan {
    fn default() -> Self {
        Self::standard(None)
    }
}

impl TryFrom<Vec<MountOp>> for MountPlan {
    type Error = SafeboxError;

    fn try_from(ops: Vec<MountOp>) -> Result<Self> {
        Self::from_ops(ops)
    }
}

impl From<MountPlan> for Vec<MountOp> {
    fn from(plan: MountPlan) -> Self {
        plan.ops
    }
}

/// Joins an absolute sandbox path onto `root`.
fn reanchor(root: Option<&Path>, path: &Path) -> PathBuf {
    match root {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
        None => path.to_path_buf(),
    }
}

/// Applies `plan` in the current mount namespace.
///
/// Failure to privatize propagation or to mount procfs aborts; a failed
/// bind mount is handed to `on_degraded` with its index in the plan and
/// the remaining operations still run. Runs between `clone(2)` and exec,
/// so it neither allocates nor logs.
///
/// # Errors
///
/// Returns the failed call of a mandatory step.
pub fn isolate(plan: &MountPlan, mut on_degraded: impl FnMut(usize, StepError)) -> StepResult {
    for (index, op) in plan.ops().iter().enumerate() {
        match op {
            MountOp::MakePrivate => make_private()?,
            MountOp::MountProc { target } => mount_proc(target)?,
            MountOp::Bind { source, target } => {
                if let Err(e) = bind_mount(source, target) {
                    on_degraded(index, e);
                }
            }
        }
    }
    Ok(())
}

fn make_private() -> StepResult {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| StepError::new("making / private", e as i32))
}

fn mount_proc(target: &Path) -> StepResult {
    // A missing mount point surfaces as the mount error below.
    let _ = std::fs::create_dir_all(target);
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| StepError::new("mounting proc", e as i32))
}

/// Creates a recursive bind mount from source to target.
///
/// # Errors
///
/// Returns `ENOENT` if the source is missing, or the failed `mount(2)`.
pub fn bind_mount(source: &Path, target: &Path) -> StepResult {
    if !source.exists() {
        return Err(StepError::new("bind source lookup", libc::ENOENT));
    }
    let _ = std::fs::create_dir_all(target);
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| StepError::new("bind mount", e as i32))
}

/// Human-readable description of the operation at `index`, for reports.
#[must_use]
pub fn describe_op(plan: &MountPlan, index: usize) -> String {
    match plan.ops().get(index) {
        Some(MountOp::Bind { source, target }) => {
            format!("bind {} -> {}", source.display(), target.display())
        }
        Some(MountOp::MountProc { target }) => format!("proc at {}", target.display()),
        Some(MountOp::MakePrivate) => "make / private".to_string(),
        None => format!("mount operation {index}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plan_privatizes_first() {
        let plan = MountPlan::standard(None);
        assert_eq!(plan.ops()[0], MountOp::MakePrivate);
        assert_eq!(
            plan.ops()[1],
            MountOp::MountProc {
                target: PathBuf::from("/proc")
            }
        );
        plan.validate().unwrap();
    }

    #[test]
    fn proc_target_follows_new_root() {
        let plan = MountPlan::standard(Some(Path::new("/srv/jail")));
        assert_eq!(
            plan.ops()[1],
            MountOp::MountProc {
                target: PathBuf::from("/srv/jail/proc")
            }
        );
    }

    #[test]
    fn mount_before_private_is_rejected() {
        let ops = vec![
            MountOp::MountProc {
                target: PathBuf::from("/proc"),
            },
            MountOp::MakePrivate,
        ];
        assert!(MountPlan::from_ops(ops).is_err());
    }

    #[test]
    fn host_binaries_are_reanchored() {
        let plan = MountPlan::empty().with_host_binaries(Some(Path::new("/jail")));
        assert_eq!(plan.ops()[0], MountOp::MakePrivate);
        for op in &plan.ops()[1..] {
            match op {
                MountOp::Bind { source, target } => {
                    assert!(target.starts_with("/jail"));
                    assert!(target.ends_with(source.strip_prefix("/").unwrap()));
                }
                other => panic!("unexpected op {other:?}"),
            }
        }
        plan.validate().unwrap();
    }

    #[test]
    fn missing_bind_source_is_enoent() {
        let err = bind_mount(Path::new("/nonexistent/safebox-src"), Path::new("/tmp")).unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
    }

    #[test]
    fn ops_are_described_by_index() {
        let plan = MountPlan::from_ops(vec![
            MountOp::MakePrivate,
            MountOp::Bind {
                source: PathBuf::from("/lib64"),
                target: PathBuf::from("/jail/lib64"),
            },
        ])
        .unwrap();
        assert_eq!(describe_op(&plan, 1), "bind /lib64 -> /jail/lib64");
        assert_eq!(describe_op(&plan, 9), "mount operation 9");
    }

    #[test]
    fn json_plan_is_validated() {
        let bad = r#"[{"op": "bind", "source": "/bin", "target": "/bin"}]"#;
        assert!(serde_json::from_str::<MountPlan>(bad).is_err());

        let good = r#"[{"op": "make-private"}, {"op": "mount-proc", "target": "/proc"}]"#;
        let plan: MountPlan = serde_json::from_str(good).unwrap();
        assert_eq!(plan, MountPlan::standard(None));
    }
}
