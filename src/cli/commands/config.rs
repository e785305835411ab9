//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print the configuration with defaults filled in.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config_path),
        ConfigCommand::Show { format } => show_config(config_path, &format),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("✓ {:?} is valid", path);
    println!("  {} resource type(s) served", config.resources.len());
    for resource in &config.resources {
        let ttl = resource
            .ttl_seconds
            .map_or_else(|| "no expiry".to_string(), |s| format!("ttl {}s", s));
        println!(
            "  - {}/{} {} ({}) -> {} [{}]",
            resource.group, resource.version, resource.kind, resource.plural, resource.keyspace, ttl
        );
    }
    if config.authorization.rules.is_empty() {
        println!("  ⚠ no authorization rules; default is {:?}", config.authorization.default);
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    let rendered = render_config(&config, format)?;
    println!("{}", rendered);
    Ok(())
}

fn render_config(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(config).context("failed to render config as JSON"),
        "toml" => toml::to_string_pretty(config).context("failed to render config as TOML"),
        other => anyhow::bail!("unknown format {:?}, expected toml or json", other),
    }
}
