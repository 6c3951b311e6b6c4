//! Formatted output helpers for CLI commands.

use safebox_runtime::supervisor::SandboxReport;

/// One-line human summary of a finished launch.
#[must_use]
pub fn describe_report(report: &SandboxReport) -> String {
    let mut line = format!("sandbox pid {} {}", report.pid, report.outcome);
    if report.timed_out {
        line.push_str(" (timed out)");
    }
    if let Some(group) = &report.group {
        line.push_str(&format!(", group {group}"));
    }
    line
}

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use safebox_common::types::ExitOutcome;

    use super::*;

    fn report(outcome: ExitOutcome, timed_out: bool) -> SandboxReport {
        SandboxReport {
            outcome,
            pid: 4242,
            group: Some("safebox-0123456789ab".into()),
            timed_out,
            started_at: "2026-01-01T00:00:00+00:00".into(),
            degradations: Vec::new(),
        }
    }

    #[test]
    fn describes_normal_exit() {
        assert_eq!(
            describe_report(&report(ExitOutcome::ExitedNormally(7), false)),
            "sandbox pid 4242 exited with code 7, group safebox-0123456789ab"
        );
    }

    #[test]
    fn describes_timeout_kill() {
        let line = describe_report(&report(ExitOutcome::KilledBySignal(9), true));
        assert!(line.contains("killed by signal 9 (timed out)"));
    }

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_kib() {
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
    }

    #[test]
    fn format_bytes_displays_gib() {
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }
}
