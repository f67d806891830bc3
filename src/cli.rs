//! Command-line surface shared by the appliance binaries.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Flags accepted by every duorec process
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run a single tick / scan pass and exit (for tests)
    #[arg(long)]
    pub once: bool,
}

/// Normal termination
pub const EXIT_OK: ExitCode = ExitCode::SUCCESS;

/// Missing or invalid configuration, detected before any work starts
pub fn exit_config_error() -> ExitCode {
    ExitCode::from(1)
}

/// Unrecoverable runtime failure
pub fn exit_runtime_error() -> ExitCode {
    ExitCode::from(2)
}
