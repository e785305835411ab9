//! Lease lifecycle.
//!
//! The lease manager is the only component that grants, refreshes or revokes
//! leases; the resource store only attaches lease ids to writes. Each lease
//! can have an independent keep-alive task. A keep-alive task that finds its
//! lease gone stops quietly: expiry is the intended outcome of a missed
//! refresh, not an error.

use crate::store::{KvStore, LeaseId, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shortest keep-alive period.
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(100);

/// Lease choice for a CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseRequest {
    /// Use the TTL policy registered for the type, if any.
    #[default]
    Default,
    /// No expiry, regardless of policy.
    None,
    /// Fresh lease with this TTL in seconds.
    Ttl(u64),
    /// Attach to an existing lease so several records expire together.
    Shared(LeaseId),
}

impl LeaseRequest {
    /// Decide the lease for a CREATE. An explicit request wins over the
    /// type's policy; `Default` falls back to the policy.
    pub fn plan(self, policy_ttl_seconds: Option<u64>) -> Option<LeasePlan> {
        match self {
            LeaseRequest::Default => policy_ttl_seconds.map(|ttl_seconds| LeasePlan::Fresh { ttl_seconds }),
            LeaseRequest::None => None,
            LeaseRequest::Ttl(ttl_seconds) => Some(LeasePlan::Fresh { ttl_seconds }),
            LeaseRequest::Shared(lease_id) => Some(LeasePlan::Shared(lease_id)),
        }
    }
}

/// Lease a CREATE will attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePlan {
    /// Acquire a new lease first.
    Fresh { ttl_seconds: u64 },
    /// Attach to a lease the caller already holds.
    Shared(LeaseId),
}

/// Outcome of a keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Lease refreshed.
    Alive { ttl_seconds: u64 },
    /// Lease no longer exists.
    Expired,
}

/// Grants, refreshes and revokes leases.
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
    keepalives: Mutex<HashMap<LeaseId, JoinHandle<()>>>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            keepalives: Mutex::new(HashMap::new()),
        }
    }

    /// Obtain a new lease.
    pub async fn acquire(&self, ttl_seconds: u64) -> StoreResult<LeaseId> {
        let grant = self.store.lease_grant(ttl_seconds).await?;
        tracing::debug!(lease_id = grant.id, ttl_seconds, "lease granted");
        Ok(grant.id)
    }

    /// Refresh a lease once.
    pub async fn keep_alive(&self, lease_id: LeaseId) -> StoreResult<KeepAlive> {
        Ok(match self.store.lease_keep_alive(lease_id).await? {
            Some(ttl_seconds) => KeepAlive::Alive { ttl_seconds },
            None => KeepAlive::Expired,
        })
    }

    /// Refresh period for a TTL: a third of it, never below 100ms.
    pub fn keep_alive_period(ttl_seconds: u64) -> Duration {
        (Duration::from_secs(ttl_seconds) / 3).max(MIN_KEEPALIVE_PERIOD)
    }

    /// Spawn a task refreshing `lease_id` until stopped or the lease is gone.
    ///
    /// Replaces any keep-alive already running for the lease.
    pub fn start_keep_alive(&self, lease_id: LeaseId, ttl_seconds: u64) {
        let store = Arc::clone(&self.store);
        let period = Self::keep_alive_period(ttl_seconds);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.lease_keep_alive(lease_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::debug!(lease_id, "lease gone, stopping keep-alive");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(lease_id, error = %e, "lease keep-alive failed");
                    }
                }
            }
        });

        if let Some(previous) = self.keepalives.lock().insert(lease_id, handle) {
            previous.abort();
        }
    }

    /// Stop refreshing a lease. It expires after its TTL.
    pub fn stop_keep_alive(&self, lease_id: LeaseId) -> bool {
        match self.keepalives.lock().remove(&lease_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a keep-alive task is still running for the lease.
    pub fn is_kept_alive(&self, lease_id: LeaseId) -> bool {
        self.keepalives
            .lock()
            .get(&lease_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// End a lease now, deleting every attached record.
    pub async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()> {
        self.stop_keep_alive(lease_id);
        self.store.lease_revoke(lease_id).await?;
        tracing::debug!(lease_id, "lease revoked");
        Ok(())
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        for (_, handle) in self.keepalives.get_mut().drain() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("keepalives", &self.keepalives.lock().len())
            .finish()
    }
}
