//! Command-line argument parsing.

use clap::Parser;

/// Compass deployment-network bootstrap
#[derive(Parser, Debug)]
#[command(name = "compass-netsetup")]
#[command(about = "Configure the management ports of a Compass deployment host from $NETWORK")]
#[command(version)]
pub struct Args {
    /// Path to tool configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Bridge the management ports attach to [default: br-external]
    #[arg(long)]
    pub bridge: Option<String>,

    /// Management role to configure; repeat for several [default: mgmt]
    #[arg(long = "role", value_name = "ROLE")]
    pub roles: Vec<String>,

    /// Print the commands that would run without touching the host
    #[arg(long)]
    pub dry_run: bool,

    /// Advisory lock file serializing concurrent runs
    #[arg(long)]
    pub lock_file: Option<String>,

    /// Print the actuation report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}
