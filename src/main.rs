//! manetd, a MANET routing daemon shell.
//!
//! Aggregates and dispatches RFC 5444 packets over UDP; routing protocol
//! modules register their message consumers and providers against the
//! engine in `rfc5444-core`. Run `manetd --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod run;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = rfc5444_core::Config::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Check => {
            let config = rfc5444_core::Config::load(&cli.config)?;
            config.validate()?;
            println!("{} is valid", cli.config.display());
        }
        Commands::Run => {
            run::run(&cli.config)?;
        }
    }

    Ok(())
}
