//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: store → registry → maintenance
//! - Shutdown order: maintenance → registry → store

use crate::core::config::Config;
use crate::registry::facade::Registry;
use crate::store::memory::MemoryStore;
use crate::store::KvStore;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Embedded store health.
    pub store: ComponentHealth,
    /// Registry facade health.
    pub registry: ComponentHealth,
    /// Lease sweep and compaction task health.
    pub maintenance: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            store: ComponentHealth::Starting,
            registry: ComponentHealth::Starting,
            maintenance: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.store == ComponentHealth::Healthy && self.registry == ComponentHealth::Healthy
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        ![self.store, self.registry, self.maintenance].contains(&ComponentHealth::Failed)
    }
}

/// Strata runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Embedded store.
    store: Option<Arc<MemoryStore>>,

    /// Registry facade.
    registry: Option<Arc<Registry>>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Lease sweep and compaction task.
    maintenance_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            store: None,
            registry: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            maintenance_handle: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the embedded store (if started).
    pub fn store(&self) -> Option<&Arc<MemoryStore>> {
        self.store.as_ref()
    }

    /// Get the registry (if started).
    pub fn registry(&self) -> Option<&Arc<Registry>> {
        self.registry.as_ref()
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            resources = self.config.resources.len(),
            "starting Strata runtime"
        );

        self.init_store();
        self.init_registry()?;
        self.start_maintenance();

        self.running.store(true, Ordering::Release);
        tracing::info!("Strata runtime started");
        Ok(())
    }

    fn init_store(&mut self) {
        tracing::debug!("initializing embedded store");
        self.store = Some(Arc::new(MemoryStore::new()));
        self.health.store = ComponentHealth::Healthy;
    }

    fn init_registry(&mut self) -> Result<()> {
        tracing::debug!("initializing registry");
        let store = self
            .store
            .clone()
            .context("store must be initialized before the registry")?;

        let registry_config = self.config.registry_config()?;
        let served = registry_config.resolver().keyspaces();
        let registry = Registry::new(registry_config, store as Arc<dyn KvStore>);
        self.registry = Some(Arc::new(registry));
        self.health.registry = ComponentHealth::Healthy;

        for keyspace in &served {
            tracing::info!(%keyspace, "serving keyspace");
        }
        Ok(())
    }

    /// Spawn the periodic lease sweep and history compaction.
    fn start_maintenance(&mut self) {
        let Some(store) = self.store.clone() else {
            self.health.maintenance = ComponentHealth::Failed;
            return;
        };
        let period = Duration::from_millis(self.config.store.expiry_scan_period_ms);
        let retention = self.config.store.history_retention;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = store.expire_due();
                        if expired > 0 {
                            tracing::debug!(expired, "expired leased records");
                        }
                        if retention > 0 {
                            store.compact_retaining(retention);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("maintenance task stopped");
        });

        self.maintenance_handle = Some(handle);
        self.health.maintenance = ComponentHealth::Healthy;
        tracing::info!(
            period_ms = period.as_millis() as u64,
            retention,
            "maintenance task started"
        );
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until Ctrl-C or [`Runtime::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Strata runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.health.maintenance = ComponentHealth::Stopping;
        if let Some(handle) = self.maintenance_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "maintenance task panicked"),
                Err(_) => tracing::warn!("maintenance task stop timed out"),
            }
        }
        self.health.maintenance = ComponentHealth::Stopped;

        self.health.registry = ComponentHealth::Stopping;
        self.registry = None;
        self.health.registry = ComponentHealth::Stopped;

        self.health.store = ComponentHealth::Stopping;
        if let Some(store) = self.store.take() {
            let stats = store.stats();
            tracing::info!(
                revision = stats.revision,
                live_keys = stats.live_keys,
                leases = stats.leases,
                "embedded store closed"
            );
        }
        self.health.store = ComponentHealth::Stopped;

        tracing::info!("Strata runtime stopped");
        Ok(())
    }
}
