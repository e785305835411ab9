//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use strata::core::config::Config;
use strata::core::error::{ErrorCode, RegistryError};
use strata::core::time::{Clock, ManualClock};
use strata::registry::facade::{Registry, RegistryConfig, RegistryConfigBuilder};
use strata::registry::model::{Gvk, Identity, ResourceIdentity, WatchEvent};
use strata::registry::resolver::KindNames;
use strata::registry::watch::WatchSubscription;
use strata::store::memory::MemoryStore;
use tempfile::NamedTempFile;

pub const STOCK_GROUP: &str = "logistics.stockr.io";
pub const SANDBOX_GROUP: &str = "infra.developer.io";
pub const V1ALPHA1: &str = "v1alpha1";

/// Configuration serving stocks and sandboxes.
pub const STOCK_CONFIG: &str = r#"
[store]
expiry_scan_period_ms = 100

[[resources]]
group = "logistics.stockr.io"
version = "v1alpha1"
kind = "stock"
plural = "stocks"
keyspace = "/registry/stocks"

[[resources]]
group = "infra.developer.io"
version = "v1alpha1"
kind = "sandbox"
plural = "sandboxes"
keyspace = "/registry/sandboxes"
ttl_seconds = 30
"#;

/// Write a configuration file.
pub fn create_config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

pub fn stock_gvk() -> Gvk {
    Gvk::new(STOCK_GROUP, V1ALPHA1, "stock")
}

pub fn stocks_gvk() -> Gvk {
    Gvk::new(STOCK_GROUP, V1ALPHA1, "stocks")
}

pub fn sandbox_gvk() -> Gvk {
    Gvk::new(SANDBOX_GROUP, V1ALPHA1, "sandbox")
}

pub fn stock(name: &str) -> ResourceIdentity {
    stock_gvk().named(name)
}

pub fn sandbox(name: &str) -> ResourceIdentity {
    sandbox_gvk().named(name)
}

pub fn user() -> Identity {
    Identity::new("alice").with_group("developers")
}

pub fn stock_payload(quantity: u64) -> serde_json::Value {
    json!({ "sku": "widget", "quantity": quantity })
}

/// Builder serving stocks and sandboxes, without TTL policies.
pub fn stock_builder() -> RegistryConfigBuilder {
    RegistryConfig::builder()
        .serve(
            STOCK_GROUP,
            V1ALPHA1,
            KindNames::new("stock", "stocks"),
            "/registry/stocks",
        )
        .serve(
            SANDBOX_GROUP,
            V1ALPHA1,
            KindNames::new("sandbox", "sandboxes"),
            "/registry/sandboxes",
        )
}

/// Registry over a fresh store driven by a manual clock.
pub fn registry_with(builder: RegistryConfigBuilder) -> (Registry, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock) as Arc<dyn Clock>));
    let config = builder.build().expect("Failed to build registry config");
    let registry = Registry::new(config, store.clone());
    (registry, store, clock)
}

/// Registry serving stocks and sandboxes with no policies.
pub fn stock_registry() -> (Registry, Arc<MemoryStore>, Arc<ManualClock>) {
    registry_with(stock_builder())
}

/// Receive the next watch event, failing the test after one second.
pub async fn next_event(subscription: &mut WatchSubscription) -> WatchEvent {
    match tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await {
        Ok(Some(Ok(event))) => event,
        Ok(Some(Err(e))) => panic!("Expected event, got error: {}", e),
        Ok(None) => panic!("Expected event, subscription ended"),
        Err(_) => panic!("Timed out waiting for watch event"),
    }
}

/// Receive the next watch error, failing the test after one second.
pub async fn next_error(subscription: &mut WatchSubscription) -> RegistryError {
    match tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await {
        Ok(Some(Err(e))) => e,
        Ok(Some(Ok(event))) => panic!("Expected error, got event: {:?}", event),
        Ok(None) => panic!("Expected error, subscription ended"),
        Err(_) => panic!("Timed out waiting for watch error"),
    }
}

/// Assert nothing arrives on a subscription for a short while.
pub async fn assert_quiet(subscription: &mut WatchSubscription) {
    if let Ok(item) = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await {
        panic!("Expected no delivery, got {:?}", item);
    }
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Assert an error carries the given code.
#[track_caller]
pub fn assert_code<T: std::fmt::Debug>(result: Result<T, RegistryError>, code: ErrorCode) -> RegistryError {
    match result {
        Ok(v) => panic!("Expected {} error, got Ok: {:?}", code, v),
        Err(e) => {
            assert_eq!(e.code(), code, "unexpected error: {}", e);
            e
        }
    }
}

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}
