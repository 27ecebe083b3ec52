//! CLI definitions for manetd.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "manetd",
    version,
    about = "RFC 5444 packet aggregation and dispatch daemon",
    long_about = None
)]
pub struct Cli {
    /// Path to manetd.toml config file
    #[clap(long, short, default_value = "manetd.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground (Ctrl-C to stop)
    Run,

    /// Validate the configuration file and exit
    Check,

    /// Print an example manetd.toml to stdout
    Init,
}
