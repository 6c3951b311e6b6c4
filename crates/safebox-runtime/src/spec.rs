//! Description of one sandbox launch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use safebox_common::config::SafeboxConfig;
use safebox_common::error::{Result, SafeboxError};
use safebox_common::types::{CpuQuota, Enforcement, GroupName, ResourceLimits};
use safebox_core::filesystem::mount::MountPlan;
use safebox_core::namespace::NamespaceSet;
use safebox_core::namespace::user::IdentityMapping;
use safebox_core::privilege::DropIdentity;
use safebox_core::seccomp::SeccompPolicy;

/// Which cgroup the confined process joins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CgroupSelection {
    /// A fresh group with a random name, removed afterwards.
    #[default]
    Generated,
    /// A caller-named group, created if absent; removed afterwards only if
    /// this launch created it.
    Named(GroupName),
    /// No cgroup confinement.
    Skip,
}

/// Immutable, validated description of a launch.
///
/// Built with [`SandboxSpec::builder`]; consumed by
/// [`crate::supervisor::Supervisor::launch`].
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    program: PathBuf,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    namespaces: NamespaceSet,
    mount_plan: MountPlan,
    new_root: Option<PathBuf>,
    drop_identity: DropIdentity,
    identity_mapping: Option<IdentityMapping>,
    limits: ResourceLimits,
    cgroup: CgroupSelection,
    cgroup_root: PathBuf,
    policy: SeccompPolicy,
    hostname: Option<String>,
    timeout: Option<Duration>,
    enforcement: Enforcement,
}

impl SandboxSpec {
    /// Starts a builder for `program` with built-in defaults.
    pub fn builder(program: impl Into<PathBuf>) -> SandboxSpecBuilder {
        SandboxSpecBuilder::new(program.into())
    }

    /// Program to execute, as given by the caller.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Argument vector, `argv[0]` included.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Environment of the confined program.
    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Value of `PATH` in the confined environment.
    #[must_use]
    pub fn path_env(&self) -> Option<&str> {
        self.env
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.as_str())
    }

    /// Namespaces the confined process is created in.
    #[must_use]
    pub const fn namespaces(&self) -> &NamespaceSet {
        &self.namespaces
    }

    /// Mount operations applied inside the mount namespace.
    #[must_use]
    pub const fn mount_plan(&self) -> &MountPlan {
        &self.mount_plan
    }

    /// Directory that becomes `/` for the program.
    #[must_use]
    pub fn new_root(&self) -> Option<&Path> {
        self.new_root.as_deref()
    }

    /// Identity the program runs as.
    #[must_use]
    pub const fn drop_identity(&self) -> &DropIdentity {
        &self.drop_identity
    }

    /// Explicit user namespace mapping, if the caller gave one.
    #[must_use]
    pub const fn identity_mapping(&self) -> Option<&IdentityMapping> {
        self.identity_mapping.as_ref()
    }

    /// Resource limits written to the cgroup.
    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Cgroup the process joins.
    #[must_use]
    pub const fn cgroup(&self) -> &CgroupSelection {
        &self.cgroup
    }

    /// Mount point of the cgroup filesystem.
    #[must_use]
    pub fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }

    /// Syscall policy loaded before exec.
    #[must_use]
    pub const fn policy(&self) -> &SeccompPolicy {
        &self.policy
    }

    /// Hostname set in the UTS namespace.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Wall-clock limit after which the process is killed.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Reaction to resource-limit failures.
    #[must_use]
    pub const fn enforcement(&self) -> Enforcement {
        self.enforcement
    }
}

/// Builder for [`SandboxSpec`].
#[derive(Debug, Clone)]
pub struct SandboxSpecBuilder {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    namespaces: NamespaceSet,
    mount_plan: Option<MountPlan>,
    bind_host_binaries: bool,
    new_root: Option<PathBuf>,
    drop_identity: DropIdentity,
    identity_mapping: Option<IdentityMapping>,
    limits: ResourceLimits,
    cgroup: CgroupSelection,
    cgroup_root: PathBuf,
    policy: SeccompPolicy,
    hostname: Option<String>,
    timeout: Option<Duration>,
    enforcement: Enforcement,
}

impl SandboxSpecBuilder {
    fn new(program: PathBuf) -> Self {
        let config = SafeboxConfig::default();
        Self {
            program,
            args: Vec::new(),
            env: vec![("PATH".to_string(), config.path_env)],
            namespaces: NamespaceSet::default(),
            mount_plan: None,
            bind_host_binaries: false,
            new_root: None,
            drop_identity: DropIdentity::default(),
            identity_mapping: None,
            limits: config.default_limits,
            cgroup: CgroupSelection::default(),
            cgroup_root: config.cgroup_root,
            policy: SeccompPolicy::default(),
            hostname: None,
            timeout: None,
            enforcement: config.enforcement,
        }
    }

    /// Applies configuration defaults: cgroup root, limits, enforcement,
    /// `PATH`, and the hostname when a UTS namespace is requested.
    #[must_use]
    pub fn config(mut self, config: &SafeboxConfig) -> Self {
        self.cgroup_root.clone_from(&config.cgroup_root);
        self.limits = config.default_limits.clone();
        self.enforcement = config.enforcement;
        self = self.env("PATH", &config.path_env);
        if self.namespaces.uts {
            self.hostname = Some(config.hostname.clone());
        }
        self
    }

    /// Appends one argument after `argv[0]`.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments after `argv[0]`.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable, replacing an earlier value.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    /// Replaces the namespace set.
    #[must_use]
    pub const fn namespaces(mut self, namespaces: NamespaceSet) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Replaces the derived mount plan with an explicit one.
    #[must_use]
    pub fn mount_plan(mut self, plan: MountPlan) -> Self {
        self.mount_plan = Some(plan);
        self
    }

    /// Adds bind mounts of the host binary and library directories.
    #[must_use]
    pub const fn bind_host_binaries(mut self, enabled: bool) -> Self {
        self.bind_host_binaries = enabled;
        self
    }

    /// Sets the directory that becomes `/`.
    #[must_use]
    pub fn new_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.new_root = Some(root.into());
        self
    }

    /// Sets the identity the program runs as.
    #[must_use]
    pub fn drop_identity(mut self, identity: DropIdentity) -> Self {
        self.drop_identity = identity;
        self
    }

    /// Sets an explicit user namespace mapping.
    #[must_use]
    pub const fn identity_mapping(mut self, mapping: IdentityMapping) -> Self {
        self.identity_mapping = Some(mapping);
        self
    }

    /// Replaces all resource limits.
    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the memory ceiling in bytes.
    #[must_use]
    pub const fn memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_bytes = Some(bytes);
        self
    }

    /// Sets the CPU quota and period in microseconds.
    #[must_use]
    pub const fn cpu_quota(mut self, quota_us: u64, period_us: u64) -> Self {
        self.limits.cpu = Some(CpuQuota {
            quota_us,
            period_us,
        });
        self
    }

    /// Chooses the cgroup.
    #[must_use]
    pub fn cgroup(mut self, selection: CgroupSelection) -> Self {
        self.cgroup = selection;
        self
    }

    /// Sets the cgroup filesystem mount point.
    #[must_use]
    pub fn cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Replaces the syscall policy.
    #[must_use]
    pub fn policy(mut self, policy: SeccompPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the hostname inside the UTS namespace.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Kills the program after `timeout`.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the reaction to resource-limit failures.
    #[must_use]
    pub const fn enforcement(mut self, enforcement: Enforcement) -> Self {
        self.enforcement = enforcement;
        self
    }

    /// Validates the combination and freezes it.
    ///
    /// # Errors
    ///
    /// Returns [`SafeboxError::Config`] for contradictory settings, and
    /// [`SafeboxError::Policy`] for an invalid syscall table.
    pub fn build(self) -> Result<SandboxSpec> {
        let program_str = self.program.to_string_lossy().into_owned();
        if program_str.is_empty() {
            return Err(config_error("program must not be empty"));
        }
        if self.new_root.is_some() && !self.program.is_absolute() {
            return Err(config_error(
                "program must be an absolute path inside the new root",
            ));
        }
        if let Some(root) = &self.new_root {
            if !root.is_absolute() || !root.is_dir() {
                return Err(config_error(format!(
                    "new root {} must be an existing absolute directory",
                    root.display()
                )));
            }
        }
        if self.hostname.is_some() && !self.namespaces.uts {
            return Err(config_error("a hostname requires the UTS namespace"));
        }
        if self.identity_mapping.is_some() && !self.namespaces.user {
            return Err(config_error("an identity mapping requires the user namespace"));
        }

        let mount_plan = match self.mount_plan {
            Some(plan) => plan,
            None if self.namespaces.mount => MountPlan::standard(self.new_root.as_deref()),
            None => MountPlan::empty(),
        };
        let mount_plan = if self.bind_host_binaries {
            mount_plan.with_host_binaries(self.new_root.as_deref())
        } else {
            mount_plan
        };
        mount_plan.validate()?;
        if !mount_plan.is_empty() && !self.namespaces.mount {
            return Err(config_error(
                "mount operations require the mount namespace",
            ));
        }

        let _ = self.policy.validate()?;

        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(program_str);
        argv.extend(self.args);

        Ok(SandboxSpec {
            program: self.program,
            argv,
            env: self.env,
            namespaces: self.namespaces,
            mount_plan,
            new_root: self.new_root,
            drop_identity: self.drop_identity,
            identity_mapping: self.identity_mapping,
            limits: self.limits,
            cgroup: self.cgroup,
            cgroup_root: self.cgroup_root,
            policy: self.policy,
            hostname: self.hostname,
            timeout: self.timeout,
            enforcement: self.enforcement,
        })
    }
}

fn config_error(message: impl Into<String>) -> SafeboxError {
    SafeboxError::Config {
        message: message.into(),
    }
}
