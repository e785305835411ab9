//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start the registry.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override the lease sweep period (milliseconds).
    #[arg(long)]
    pub expiry_scan_period_ms: Option<u64>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_default_level: &str) {}

/// Run the start command with the given config path.
pub async fn run_start_with_config(
    config_path: &Path,
    args: StartArgs,
    log_level: Option<String>,
) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        expiry_scan_period_ms: args.expiry_scan_period_ms,
    });

    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
