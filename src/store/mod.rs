//! Underlying key-value store contract.
//!
//! The registry needs exactly five primitives from its backing store:
//! conditional (compare-and-swap) writes, snapshot range reads carrying a
//! revision marker, leases, a resumable prefix watch, and the current
//! revision. Any store offering these is interchangeable behind [`KvStore`].
//!
//! Revisions are a single store-wide counter bumped once per committed
//! mutation. A record's `mod_revision` is the revision of its last write and
//! doubles as the registry's version token.
//!
//! - [`memory`] - embedded MVCC store used by the runtime and the tests

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Lease identifier.
pub type LeaseId = i64;

/// Watch identifier, unique per store instance.
pub type WatchId = u64;

/// A key-value pair as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key (byte string).
    pub key: Vec<u8>,
    /// The value (byte string).
    pub value: Vec<u8>,
    /// Revision when this key was (re)created.
    pub create_revision: u64,
    /// Revision of the last modification.
    pub mod_revision: u64,
    /// Number of writes since the key was (re)created.
    pub version: u64,
    /// Attached lease, if any.
    pub lease_id: Option<LeaseId>,
}

/// Event type for watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted (explicitly or by lease expiry).
    Delete,
}

/// A committed change delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    /// Type of event.
    pub event_type: EventType,
    /// New state for Put, last live state for Delete.
    pub kv: KeyValue,
    /// Previous live state, if the key existed.
    pub prev_kv: Option<KeyValue>,
    /// Revision at which this change committed.
    pub revision: u64,
}

impl KvEvent {
    /// Whether this Put created the key (rather than updating it).
    pub fn is_create(&self) -> bool {
        self.event_type == EventType::Put && self.prev_kv.is_none()
    }
}

/// Message on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    /// A committed change.
    Event(KvEvent),
    /// Historical replay is complete; everything after this is live.
    Synced {
        /// Store revision when the watch was registered.
        revision: u64,
    },
}

/// Condition evaluated against the key's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    /// Key must not exist.
    Absent,
    /// Key must exist.
    Present,
    /// Key must exist with exactly this mod revision.
    ModRevision(u64),
}

impl Compare {
    /// Evaluate the condition against the current live record.
    pub fn matches(&self, current: Option<&KeyValue>) -> bool {
        match (self, current) {
            (Compare::Absent, None) => true,
            (Compare::Absent, Some(_)) => false,
            (Compare::Present, current) => current.is_some(),
            (Compare::ModRevision(rev), Some(kv)) => kv.mod_revision == *rev,
            (Compare::ModRevision(_), None) => false,
        }
    }
}

/// How a put treats the key's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAttachment {
    /// Detach any lease.
    None,
    /// Attach the given lease.
    Attach(LeaseId),
    /// Keep whatever lease the key currently has.
    Keep,
}

/// Write applied when the comparison succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Store a value.
    Put {
        value: Vec<u8>,
        lease: LeaseAttachment,
    },
    /// Remove the key.
    Delete,
}

/// Single-key compare-and-swap transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalWrite {
    /// Target key.
    pub key: Vec<u8>,
    /// Guard evaluated atomically with the write.
    pub compare: Compare,
    /// Write applied when the guard holds.
    pub op: WriteOp,
}

impl ConditionalWrite {
    /// Put `value` only if the key is absent.
    pub fn create(key: Vec<u8>, value: Vec<u8>, lease: Option<LeaseId>) -> Self {
        let lease = match lease {
            Some(id) => LeaseAttachment::Attach(id),
            None => LeaseAttachment::None,
        };
        Self {
            key,
            compare: Compare::Absent,
            op: WriteOp::Put { value, lease },
        }
    }

    /// Put `value` only if the key is at `revision`, keeping its lease.
    pub fn update(key: Vec<u8>, value: Vec<u8>, revision: u64) -> Self {
        Self {
            key,
            compare: Compare::ModRevision(revision),
            op: WriteOp::Put {
                value,
                lease: LeaseAttachment::Keep,
            },
        }
    }

    /// Delete the key, optionally only at `revision`.
    pub fn delete(key: Vec<u8>, revision: Option<u64>) -> Self {
        Self {
            key,
            compare: revision.map_or(Compare::Present, Compare::ModRevision),
            op: WriteOp::Delete,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    /// The guard held and the write committed.
    Committed {
        /// Revision of the commit.
        revision: u64,
        /// Live record before the write.
        prev: Option<KeyValue>,
    },
    /// The guard failed; nothing was written.
    Failed {
        /// Current live record.
        current: Option<KeyValue>,
        /// Store revision at evaluation.
        revision: u64,
    },
}

/// Prefix range read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeRequest {
    /// Key prefix.
    pub prefix: Vec<u8>,
    /// Only return keys strictly greater than this one.
    pub start_after: Option<Vec<u8>>,
    /// Maximum number of keys (0 for no limit).
    pub limit: usize,
    /// Revision to read at (None for latest).
    pub revision: Option<u64>,
}

impl RangeRequest {
    /// Read every key under `prefix` at the latest revision.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }
}

/// Range read result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResponse {
    /// Matching pairs, ordered by key.
    pub kvs: Vec<KeyValue>,
    /// Revision the read was served at.
    pub revision: u64,
    /// More keys remain past the limit.
    pub more: bool,
}

/// Granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    /// Assigned lease ID.
    pub id: LeaseId,
    /// Granted TTL in seconds.
    pub ttl_seconds: u64,
}

/// Stream of watch messages for one store watch.
///
/// The stream ends (returns `None`) when the watch is cancelled.
#[derive(Debug)]
pub struct WatchStream {
    id: WatchId,
    rx: mpsc::UnboundedReceiver<Result<WatchMessage, StoreError>>,
}

impl WatchStream {
    /// Wrap a receiver fed by a store implementation.
    pub fn new(id: WatchId, rx: mpsc::UnboundedReceiver<Result<WatchMessage, StoreError>>) -> Self {
        Self { id, rx }
    }

    /// Watch identifier, used for [`KvStore::cancel_watch`].
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Option<Result<WatchMessage, StoreError>> {
        self.rx.recv().await
    }
}

/// Store-level failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused service.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// Requested revision has been compacted.
    #[error("revision {revision} has been compacted; compaction floor is {compaction_floor}")]
    Compacted {
        revision: u64,
        compaction_floor: u64,
    },

    /// Lease not found (never granted, revoked or expired).
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: LeaseId },

    /// Request was malformed.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl StoreError {
    /// Create an Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Whether the failure is transient connectivity.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// The five primitives the registry requires from its backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Apply a single-key compare-and-swap write.
    async fn txn(&self, write: ConditionalWrite) -> StoreResult<TxnOutcome>;

    /// Read a single key at the latest revision.
    async fn get(&self, key: &[u8]) -> StoreResult<(Option<KeyValue>, u64)>;

    /// Snapshot-consistent prefix range read.
    async fn range(&self, request: RangeRequest) -> StoreResult<RangeResponse>;

    /// Grant a lease with the given TTL.
    async fn lease_grant(&self, ttl_seconds: u64) -> StoreResult<LeaseGrant>;

    /// Refresh a lease. Returns the remaining TTL in seconds, or `None` if
    /// the lease no longer exists.
    async fn lease_keep_alive(&self, lease_id: LeaseId) -> StoreResult<Option<u64>>;

    /// Revoke a lease, deleting every attached key.
    async fn lease_revoke(&self, lease_id: LeaseId) -> StoreResult<()>;

    /// Watch every key under `prefix`.
    ///
    /// With `start_revision`, events from that revision on are replayed
    /// before a [`WatchMessage::Synced`] marker; without it, only changes
    /// after the current revision are delivered (the marker comes first).
    async fn watch(&self, prefix: &[u8], start_revision: Option<u64>) -> StoreResult<WatchStream>;

    /// Cancel a watch, releasing its server-side state immediately.
    fn cancel_watch(&self, watch_id: WatchId);

    /// Latest committed revision.
    async fn current_revision(&self) -> StoreResult<u64>;
}
