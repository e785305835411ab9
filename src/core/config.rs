//! Configuration parsing and validation.
//!
//! Strata configuration is loaded from TOML files with CLI overrides and
//! turned into an immutable [`RegistryConfig`] at startup.

use crate::registry::authz::{Decision, Rule, RuleAuthorizer};
use crate::registry::facade::RegistryConfig;
use crate::registry::resolver::KindNames;
use crate::registry::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Embedded store tuning.
    #[serde(default)]
    pub store: StoreConfig,

    /// Retry policy for store reads.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Served resource types.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    /// Authorization rules.
    #[serde(default)]
    pub authorization: AuthorizationConfig,
}

/// Embedded store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How often due leases are swept (milliseconds).
    #[serde(default = "default_expiry_scan_period_ms")]
    pub expiry_scan_period_ms: u64,

    /// How far a watch subscriber may fall behind.
    #[serde(default = "default_watch_channel_capacity")]
    pub watch_channel_capacity: usize,

    /// Events retained per shared watch.
    #[serde(default = "default_watch_history_capacity")]
    pub watch_history_capacity: usize,

    /// Revisions of history kept before compaction (0 keeps everything).
    #[serde(default = "default_history_retention")]
    pub history_retention: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            expiry_scan_period_ms: default_expiry_scan_period_ms(),
            watch_channel_capacity: default_watch_channel_capacity(),
            watch_history_capacity: default_watch_history_capacity(),
            history_retention: default_history_retention(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// One served resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub group: String,
    pub version: String,
    /// Singular kind.
    pub kind: String,
    /// Plural kind.
    pub plural: String,
    /// Storage prefix for every instance.
    pub keyspace: String,
    /// Lease TTL applied to every new record.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Decision when no rule matches.
    #[serde(default = "default_decision")]
    pub default: Decision,

    /// Rules, first match wins.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            default: default_decision(),
            rules: Vec::new(),
        }
    }
}

// Default value functions

fn default_expiry_scan_period_ms() -> u64 {
    500
}

fn default_watch_channel_capacity() -> usize {
    1024
}

fn default_watch_history_capacity() -> usize {
    1024
}

fn default_history_retention() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_decision() -> Decision {
    Decision::Allow
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(period) = overrides.expiry_scan_period_ms {
            self.store.expiry_scan_period_ms = period;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_retry()?;
        self.validate_telemetry()?;
        self.registry_config()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.expiry_scan_period_ms == 0 {
            anyhow::bail!("store.expiry_scan_period_ms must be > 0");
        }
        if self.store.watch_channel_capacity == 0 {
            anyhow::bail!("store.watch_channel_capacity must be > 0");
        }
        Ok(())
    }

    fn validate_retry(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be > 0");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!(
                "retry.initial_backoff_ms ({}) cannot exceed retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms,
                self.retry.max_backoff_ms
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// Build the immutable registry configuration.
    pub fn registry_config(&self) -> Result<RegistryConfig> {
        let mut builder = RegistryConfig::builder()
            .retry(self.retry)
            .watch_channel_capacity(self.store.watch_channel_capacity)
            .watch_history_capacity(self.store.watch_history_capacity)
            .authorizer(RuleAuthorizer::new(
                self.authorization.default,
                self.authorization.rules.clone(),
            ));

        for resource in &self.resources {
            builder = builder.serve(
                &resource.group,
                &resource.version,
                KindNames::new(resource.kind.as_str(), resource.plural.as_str()),
                &resource.keyspace,
            );
            if let Some(ttl_seconds) = resource.ttl_seconds {
                builder = builder.ttl(&resource.group, &resource.version, &resource.kind, ttl_seconds);
            }
        }

        builder.build().context("invalid [[resources]] configuration")
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override the lease sweep period.
    pub expiry_scan_period_ms: Option<u64>,
}
