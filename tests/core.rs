//! Core infrastructure tests.

mod common;

use common::*;
use strata::core::config::{Config, ConfigOverrides};
use strata::core::error::{ErrorCode, RegistryError};
use strata::core::runtime::{ComponentHealth, Runtime};
use strata::core::time::{Clock, ManualClock, Tick};
use strata::registry::authz::Decision;
use strata::registry::model::{Gvk, ResourceRef, Verb};
use strata::store::StoreError;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_empty_config_uses_defaults() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.store.expiry_scan_period_ms, 500);
    assert_eq!(config.store.watch_channel_capacity, 1024);
    assert_eq!(config.store.history_retention, 10_000);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.telemetry.log_level, "info");
    assert_eq!(config.authorization.default, Decision::Allow);
    assert!(config.resources.is_empty());
}

#[test]
fn parse_resources_from_file() {
    let file = create_config_file(STOCK_CONFIG);
    let config = load_config(&file);

    assert_eq!(config.resources.len(), 2);
    assert_eq!(config.resources[0].keyspace, "/registry/stocks");
    assert_eq!(config.resources[0].ttl_seconds, None);
    assert_eq!(config.resources[1].ttl_seconds, Some(30));

    let registry_config = config.registry_config().unwrap();
    let resolved = registry_config.resolver().resolve(&stocks_gvk()).unwrap();
    assert_eq!(resolved.keyspace.as_str(), "/registry/stocks");
    let sandbox = registry_config.resolver().resolve(&sandbox_gvk()).unwrap();
    assert_eq!(registry_config.ttl_for(&sandbox_gvk(), sandbox), Some(30));
    assert_eq!(registry_config.ttl_for(&stock_gvk(), resolved), None);
}

#[test]
fn validate_invalid_log_level() {
    let result = Config::from_toml(
        r#"
[telemetry]
log_level = "loud"
"#,
    );
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("log_level"));
}

#[test]
fn validate_retry_bounds() {
    let result = Config::from_toml(
        r#"
[retry]
initial_backoff_ms = 5000
max_backoff_ms = 100
"#,
    );
    let err_msg = result.unwrap_err().to_string();
    assert!(err_msg.contains("initial_backoff_ms"), "{}", err_msg);
}

#[test]
fn validate_rejects_conflicting_keyspaces() {
    let result = Config::from_toml(
        r#"
[[resources]]
group = "logistics.stockr.io"
version = "v1alpha1"
kind = "stock"
plural = "stocks"
keyspace = "/registry/stocks"

[[resources]]
group = "logistics.stockr.io"
version = "v1alpha1"
kind = "stock"
plural = "stocks"
keyspace = "/registry/other"
"#,
    );
    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("already maps to"), "{:#}", err);
}

#[test]
fn validate_rejects_empty_keyspace() {
    let result = Config::from_toml(
        r#"
[[resources]]
group = "logistics.stockr.io"
version = "v1alpha1"
kind = "stock"
plural = "stocks"
keyspace = "/"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn validate_rejects_zero_ttl() {
    let result = Config::from_toml(
        r#"
[[resources]]
group = "logistics.stockr.io"
version = "v1alpha1"
kind = "stock"
plural = "stocks"
keyspace = "/registry/stocks"
ttl_seconds = 0
"#,
    );
    assert!(result.is_err());
}

#[test]
fn parse_authorization_rules() {
    let config = Config::from_toml(
        r#"
[authorization]
default = "deny"

[[authorization.rules]]
effect = "allow"
subjects = ["group:developers"]
verbs = ["get", "list", "watch"]
"#,
    )
    .unwrap();
    assert_eq!(config.authorization.default, Decision::Deny);
    assert_eq!(config.authorization.rules.len(), 1);
    assert_eq!(
        config.authorization.rules[0].verbs,
        vec![Verb::Get, Verb::List, Verb::Watch]
    );
}

#[test]
fn apply_overrides() {
    let mut config = Config::default();
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("debug".into()),
        expiry_scan_period_ms: Some(250),
    });
    assert_eq!(config.telemetry.log_level, "debug");
    assert_eq!(config.store.expiry_scan_period_ms, 250);
}

// ============================================================================
// Error tests
// ============================================================================

fn target() -> ResourceRef {
    ResourceRef::named(Gvk::new("g", "v1", "thing"), "a")
}

#[test]
fn error_codes_are_stable() {
    let forbidden = RegistryError::forbidden(Verb::Get, target());
    assert_eq!(forbidden.code().as_str(), "FORBIDDEN");
    assert_eq!(forbidden.code().http_status(), 403);
    assert_eq!(ErrorCode::VersionConflict.as_str(), "VERSION_CONFLICT");
    assert_eq!(ErrorCode::UnservedType.http_status(), 404);
    assert_eq!(ErrorCode::StoreUnavailable.http_status(), 503);
}

#[test]
fn errors_carry_verb_and_target() {
    let err = RegistryError::invalid(Verb::Update, target(), "bad");
    assert_eq!(err.verb(), Verb::Update);
    assert_eq!(err.target(), &target());
    assert!(err.to_string().starts_with("UPDATE g/v1, Kind=thing \"a\""));
}

#[test]
fn store_errors_translate_by_verb() {
    let compacted = StoreError::Compacted {
        revision: 3,
        compaction_floor: 10,
    };
    assert_eq!(
        RegistryError::from_store(Verb::Watch, target(), compacted.clone()).code(),
        ErrorCode::WatchTerminated
    );
    assert_eq!(
        RegistryError::from_store(Verb::List, target(), compacted).code(),
        ErrorCode::InvalidRequest
    );

    let read = RegistryError::from_store(Verb::Get, target(), StoreError::unavailable("down"));
    assert_eq!(read.code(), ErrorCode::StoreUnavailable);
    assert!(read.is_retriable());
    let write = RegistryError::from_store(Verb::Create, target(), StoreError::unavailable("down"));
    assert!(!write.is_retriable());
}

// ============================================================================
// Time tests
// ============================================================================

#[test]
fn manual_clock_only_moves_forward() {
    let clock = ManualClock::new();
    assert_eq!(clock.now(), Tick::zero());
    clock.advance_ms(1500);
    assert_eq!(clock.now(), Tick::new(1500));
    clock.set(Tick::new(1000));
    assert_eq!(clock.now(), Tick::new(1500));
}

#[test]
fn tick_arithmetic() {
    let deadline = Tick::new(1000).add_ms(500);
    assert!(Tick::new(1500).is_at_or_after(deadline));
    assert!(Tick::new(1499).is_before(deadline));
    assert_eq!(Tick::new(1200).ms_until(deadline), 300);
    assert_eq!(Tick::new(2000).ms_until(deadline), 0);
}

// ============================================================================
// Runtime tests
// ============================================================================

#[tokio::test]
async fn runtime_starts_and_stops() {
    let config = Config::from_toml(STOCK_CONFIG).unwrap();
    let mut runtime = Runtime::new(config).unwrap();
    assert!(!runtime.is_ready());

    runtime.start().await.unwrap();
    assert!(runtime.is_running());
    assert!(runtime.is_ready());
    assert_eq!(runtime.health().maintenance, ComponentHealth::Healthy);

    let registry = runtime.registry().unwrap().clone();
    let created = registry
        .create(&user(), &stock("widget-1"), stock_payload(1), Default::default())
        .await
        .unwrap();
    assert_eq!(created.version, 1);

    runtime.stop().await.unwrap();
    assert!(!runtime.is_running());
    assert_eq!(runtime.health().store, ComponentHealth::Stopped);
    assert!(runtime.registry().is_none());
}

#[tokio::test]
async fn runtime_shutdown_signal_is_observed() {
    let config = Config::from_toml(STOCK_CONFIG).unwrap();
    let mut runtime = Runtime::new(config).unwrap();
    let shutdown_rx = runtime.shutdown_receiver();
    assert!(!*shutdown_rx.borrow());

    runtime.shutdown();
    runtime.wait_for_shutdown().await;
    assert!(*shutdown_rx.borrow());
}

#[test]
fn runtime_rejects_invalid_config() {
    let mut config = Config::default();
    config.store.watch_channel_capacity = 0;
    assert!(Runtime::new(config).is_err());
}

#[test]
fn shipped_sample_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/strata.toml");
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.resources.len(), 2);
    assert_eq!(config.authorization.rules.len(), 1);
    let registry_config = config.registry_config().unwrap();
    assert_eq!(registry_config.resolver().len(), 2);
}
