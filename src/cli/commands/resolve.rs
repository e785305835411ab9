//! Resolve command implementation.

use crate::core::config::Config;
use crate::registry::model::Gvk;
use anyhow::Result;
use clap::Args;
use std::path::Path;

/// Show which keyspace a type resolves to.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// API group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Kind, singular or plural.
    pub kind: String,
}

/// Run the resolve command.
pub fn run_resolve(args: ResolveArgs, config_path: &Path) -> Result<()> {
    let config = Config::from_file(config_path)?;
    let registry_config = config.registry_config()?;
    let gvk = Gvk::new(args.group, args.version, args.kind);

    match registry_config.resolver().resolve(&gvk) {
        Some(resolved) => {
            println!("{} -> {}", gvk, resolved.keyspace);
            println!(
                "  kind: {} / {}",
                resolved.names.singular, resolved.names.plural
            );
            if let Some(ttl) = registry_config.ttl_for(&gvk, resolved) {
                println!("  ttl: {}s", ttl);
            }
            Ok(())
        }
        None => anyhow::bail!("{} is not served", gvk),
    }
}
