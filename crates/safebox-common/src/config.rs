//! Global configuration model for the SafeBox engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SafeboxError};
use crate::types::{Enforcement, ResourceLimits};

/// Root configuration for the SafeBox engine.
///
/// Every field has a default, so a config file only needs to name the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafeboxConfig {
    /// Mount point of the cgroup filesystem.
    pub cgroup_root: PathBuf,
    /// Limits applied when the caller does not set any.
    pub default_limits: ResourceLimits,
    /// Reaction to resource-limit failures.
    pub enforcement: Enforcement,
    /// Hostname set inside a new UTS namespace.
    pub hostname: String,
    /// `PATH` given to the confined program.
    pub path_env: String,
}

impl Default for SafeboxConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(crate::constants::CGROUP_ROOT),
            default_limits: ResourceLimits {
                memory_bytes: Some(crate::constants::DEFAULT_MEMORY_BYTES),
                cpu: None,
            },
            enforcement: Enforcement::default(),
            hostname: crate::constants::DEFAULT_HOSTNAME.to_string(),
            path_env: crate::constants::DEFAULT_PATH_ENV.to_string(),
        }
    }
}

impl SafeboxConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SafeboxError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Loads the configuration from `path` when given, otherwise from the
    /// default location if a file exists there, otherwise returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = crate::constants::default_config_file();
        if default_path.is_file() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }
}
