//! CLI command definitions and dispatch.

pub mod cgroup;
pub mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use safebox_common::config::SafeboxConfig;

/// SafeBox: run a program inside a locked-down process sandbox.
#[derive(Parser, Debug)]
#[command(name = safebox_common::constants::BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to a JSON configuration file.
    #[arg(long, global = true, env = "SAFEBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch a program inside a sandbox and wait for it.
    Run(run::RunArgs),
    /// Manage resource groups directly.
    Cgroup(cgroup::CgroupArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails outside the exit codes it reports itself.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = SafeboxConfig::resolve(cli.config.as_deref())?;
    match cli.command {
        Command::Run(args) => run::execute(args, &config),
        Command::Cgroup(args) => Ok(cgroup::execute(args, &config)),
    }
}

/// Value parser for memory sizes such as `256MiB` or plain bytes.
pub(crate) fn parse_memory_arg(s: &str) -> Result<u64, String> {
    safebox_common::types::parse_memory(s).ok_or_else(|| format!("invalid memory size: {s}"))
}
