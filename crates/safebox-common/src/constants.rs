//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Mount point of the cgroup filesystem.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// File whose presence under [`CGROUP_ROOT`] identifies the v2 unified hierarchy.
pub const CGROUP_V2_MARKER: &str = "cgroup.controllers";

/// Memory controller directory under [`CGROUP_ROOT`] on v1 hierarchies.
pub const CGROUP_V1_MEMORY_DIR: &str = "memory";

/// Prefix of generated per-invocation group names.
pub const GROUP_PREFIX: &str = "safebox";

/// Number of random hex characters in a generated group name.
pub const GROUP_TOKEN_LEN: usize = 12;

/// Memory ceiling applied when neither the caller nor the config sets one.
pub const DEFAULT_MEMORY_BYTES: u64 = 200 * 1024 * 1024;

/// Hostname set inside a new UTS namespace.
pub const DEFAULT_HOSTNAME: &str = "safebox";

/// Search path given to the confined program when the caller sets none.
pub const DEFAULT_PATH_ENV: &str = "/bin:/usr/bin";

/// Well-known low-privilege account used for the privilege drop.
pub const UNPRIVILEGED_ACCOUNT: &str = "nobody";

/// First host id of the subordinate range a root supervisor maps into a
/// new user namespace.
pub const SUBORDINATE_ID_BASE: u32 = 100_000;

/// Number of ids in the subordinate range; covers `nobody` (65534).
pub const SUBORDINATE_ID_RANGE: u32 = 65_536;

/// Exit status of the confined process when a setup step fails before exec.
pub const SETUP_FAILURE_EXIT: i32 = 126;

/// Host directories bind-mounted when the plan asks for host binaries.
pub const HOST_BIND_DIRS: &[&str] = &["/bin", "/usr/bin", "/lib", "/lib64", "/usr/lib"];

/// Stack size for the confined process entry.
pub const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Binary name for the CLI.
pub const BIN_NAME: &str = "safebox";

/// Returns the per-user state directory (`$HOME/.safebox`), falling back to
/// `/etc/safebox` when `HOME` is unset.
fn resolve_config_dir() -> PathBuf {
    std::env::var("HOME").map_or_else(
        |_| PathBuf::from("/etc/safebox"),
        |home| PathBuf::from(home).join(".safebox"),
    )
}

static CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved configuration directory for this session.
pub fn config_dir() -> &'static PathBuf {
    CONFIG_DIR.get_or_init(resolve_config_dir)
}

/// Returns the default configuration file path.
pub fn default_config_file() -> PathBuf {
    config_dir().join("config.json")
}
