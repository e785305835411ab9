//! Strata - unified CLI entrypoint.
//!
//! Usage:
//!   strata start --config config/strata.toml
//!   strata config validate --config config/strata.toml
//!   strata config show --config config/strata.toml [--format json]
//!   strata resolve <group> <version> <kind> --config config/strata.toml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use strata::cli::commands::{run_config, run_resolve, run_start_with_config};
use strata::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/strata.toml"));

    match cli.command {
        Commands::Start(args) => run_start_with_config(&config_path, args, cli.log_level).await,
        Commands::Config(args) => run_config(args, &config_path),
        Commands::Resolve(args) => run_resolve(args, &config_path),
    }
}
