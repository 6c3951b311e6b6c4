//! CPU bandwidth control via `cpu.max`.

use std::path::Path;

use safebox_common::error::{Result, SafeboxError};
use safebox_common::types::CpuQuota;

/// Sets the CPU bandwidth limit (max microseconds per period).
///
/// Writes `quota_us period_us` to `cpu.max`, where `quota_us` is the
/// maximum CPU time allowed per `period_us` window.
///
/// # Errors
///
/// Returns an error if the quota is zero or writing to `cpu.max` fails.
pub fn set_cpu_max(cgroup_path: &Path, quota: CpuQuota) -> Result<()> {
    if quota.quota_us == 0 || quota.period_us == 0 {
        return Err(SafeboxError::ResourceLimit {
            message: format!(
                "CPU quota {} / period {} must both be positive",
                quota.quota_us, quota.period_us
            ),
        });
    }
    let file = cgroup_path.join("cpu.max");
    let value = format!("{} {}", quota.quota_us, quota.period_us);
    std::fs::write(&file, value).map_err(|e| SafeboxError::ResourceLimit {
        message: format!("writing {} failed: {e}", file.display()),
    })?;
    tracing::debug!(
        quota_us = quota.quota_us,
        period_us = quota.period_us,
        "CPU max quota set"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_quota_then_period() {
        let dir = tempfile::tempdir().unwrap();
        set_cpu_max(
            dir.path(),
            CpuQuota {
                quota_us: 50_000,
                period_us: 100_000,
            },
        )
        .unwrap();
        let written = std::fs::read_to_string(dir.path().join("cpu.max")).unwrap();
        assert_eq!(written, "50000 100000");
    }

    #[test]
    fn zero_period_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let quota = CpuQuota {
            quota_us: 1,
            period_us: 0,
        };
        assert!(set_cpu_max(dir.path(), quota).is_err());
    }
}
