//! Integration tests for sandbox launches.
//!
//! These tests are implemented in:
//! `crates/safebox-runtime/tests/sandbox_test.rs`
//!
//! Covered scenarios (root only, except the last):
//! - `exit_code_is_passed_through`: `exit 7` reports status 7
//! - `signal_death_is_reported`: `kill -SEGV $$` reports signal 11
//! - `null_pointer_fault_is_reported`: a program writing near address 0 reports signal 11
//! - `syscall_outside_policy_kills_with_sigsys`: a removed allow rule ends in `SIGSYS`
//! - `program_runs_as_nobody`: the program sees uid 65534
//! - `program_runs_inside_generated_cgroup`: `/proc/self/cgroup` names the `safebox-` group
//! - `shell_utilities_run_under_default_policy`: `cat`, `cp`, and a pipeline exit 0
//! - `user_namespace_launch_runs_program`: a user namespace launch reports status 7
//! - `user_namespace_program_holds_no_capabilities`: empty effective, permitted, and bounding sets
//! - `hostname_is_set_in_uts_namespace`: the configured hostname is visible
//! - `allocation_past_named_group_ceiling_fails`: a 100 MiB group stops a 300 MB allocation
//! - `concurrent_launches_get_distinct_groups`: parallel launches get their own groups
//! - `timeout_kills_busy_program`: the watchdog delivers `SIGKILL`
//! - `missing_program_fails_at_exec`: a setup failure is an error, not an exit code
//! - `unprivileged_launch_fails_at_spawn`: namespace creation needs privilege
