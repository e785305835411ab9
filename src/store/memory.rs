//! Embedded MVCC store.
//!
//! An in-process [`KvStore`] holding:
//! - a per-key revision chain (tombstones included) for snapshot reads
//! - an event log keyed by revision for watch replay
//! - lease records with clock-driven deadlines
//! - registered prefix watchers
//!
//! Every mutation bumps the store revision by exactly one, so events carry
//! strictly increasing revisions even when a single lease expiry removes many
//! keys. Due leases are swept before every operation and by
//! [`MemoryStore::expire_due`], which the runtime calls periodically.

use super::{
    Compare, ConditionalWrite, EventType, KeyValue, KvEvent, KvStore, LeaseAttachment, LeaseGrant,
    LeaseId, RangeRequest, RangeResponse, StoreError, StoreResult, TxnOutcome, WatchId,
    WatchMessage, WatchStream, WriteOp,
};
use crate::core::time::{Clock, Tick, TokioClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

bitflags::bitflags! {
    /// Metadata flags for a stored revision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct KvFlags: u32 {
        /// Key has been deleted (tombstone).
        const DELETED = 0b0000_0001;
    }
}

/// One entry in a key's revision chain.
#[derive(Debug, Clone)]
struct StoredRevision {
    kv: KeyValue,
    flags: KvFlags,
}

impl StoredRevision {
    fn is_deleted(&self) -> bool {
        self.flags.contains(KvFlags::DELETED)
    }
}

/// A lease record.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    /// Unique lease identifier.
    pub lease_id: LeaseId,
    /// TTL in milliseconds.
    pub ttl_ms: u64,
    /// Tick when the lease was granted.
    pub granted_at: Tick,
    /// Tick when the lease was last refreshed.
    pub refreshed_at: Tick,
    /// Tick when the lease expires unless renewed.
    pub keepalive_deadline: Tick,
    /// Keys attached to this lease.
    pub attached_keys: HashSet<Vec<u8>>,
}

impl LeaseRecord {
    fn new(lease_id: LeaseId, ttl_ms: u64, granted_at: Tick) -> Self {
        Self {
            lease_id,
            ttl_ms,
            granted_at,
            refreshed_at: granted_at,
            keepalive_deadline: granted_at.add_ms(ttl_ms),
            attached_keys: HashSet::new(),
        }
    }

    /// Check if the lease has expired at the given tick.
    pub fn is_expired_at(&self, tick: Tick) -> bool {
        tick.is_at_or_after(self.keepalive_deadline)
    }

    fn keepalive(&mut self, now: Tick) {
        self.refreshed_at = now;
        self.keepalive_deadline = now.add_ms(self.ttl_ms);
    }
}

struct Watcher {
    prefix: Vec<u8>,
    tx: mpsc::UnboundedSender<Result<WatchMessage, StoreError>>,
}

#[derive(Default)]
struct StoreState {
    revision: u64,
    compaction_floor: u64,
    index: BTreeMap<Vec<u8>, Vec<StoredRevision>>,
    events: BTreeMap<u64, KvEvent>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease_id: LeaseId,
    watchers: HashMap<WatchId, Watcher>,
    next_watch_id: WatchId,
}

impl StoreState {
    fn new() -> Self {
        Self {
            next_lease_id: 1,
            next_watch_id: 1,
            ..Default::default()
        }
    }

    fn latest(&self, key: &[u8]) -> Option<&KeyValue> {
        self.index
            .get(key)
            .and_then(|chain| chain.last())
            .filter(|r| !r.is_deleted())
            .map(|r| &r.kv)
    }

    fn at_revision(&self, key: &[u8], revision: u64) -> Option<&KeyValue> {
        self.index
            .get(key)?
            .iter()
            .rev()
            .find(|r| r.kv.mod_revision <= revision)
            .filter(|r| !r.is_deleted())
            .map(|r| &r.kv)
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>, lease: LeaseAttachment) -> (u64, Option<KeyValue>) {
        self.revision += 1;
        let revision = self.revision;
        let prev = self.latest(&key).cloned();

        let lease_id = match lease {
            LeaseAttachment::None => None,
            LeaseAttachment::Attach(id) => Some(id),
            LeaseAttachment::Keep => prev.as_ref().and_then(|p| p.lease_id),
        };
        if let Some(old) = prev.as_ref().and_then(|p| p.lease_id) {
            if Some(old) != lease_id {
                if let Some(l) = self.leases.get_mut(&old) {
                    l.attached_keys.remove(&key);
                }
            }
        }
        if let Some(id) = lease_id {
            if let Some(l) = self.leases.get_mut(&id) {
                l.attached_keys.insert(key.clone());
            }
        }

        let (create_revision, version) = match &prev {
            Some(p) => (p.create_revision, p.version + 1),
            None => (revision, 1),
        };
        let kv = KeyValue {
            key: key.clone(),
            value,
            create_revision,
            mod_revision: revision,
            version,
            lease_id,
        };
        self.index.entry(key).or_default().push(StoredRevision {
            kv: kv.clone(),
            flags: KvFlags::empty(),
        });
        self.emit(KvEvent {
            event_type: EventType::Put,
            kv,
            prev_kv: prev.clone(),
            revision,
        });
        (revision, prev)
    }

    fn delete(&mut self, key: &[u8]) -> Option<(u64, KeyValue)> {
        let prev = self.latest(key).cloned()?;
        self.revision += 1;
        let revision = self.revision;

        if let Some(id) = prev.lease_id {
            if let Some(l) = self.leases.get_mut(&id) {
                l.attached_keys.remove(key);
            }
        }

        let mut tombstone = prev.clone();
        tombstone.mod_revision = revision;
        self.index
            .entry(key.to_vec())
            .or_default()
            .push(StoredRevision {
                kv: tombstone,
                flags: KvFlags::DELETED,
            });
        self.emit(KvEvent {
            event_type: EventType::Delete,
            kv: prev.clone(),
            prev_kv: Some(prev.clone()),
            revision,
        });
        Some((revision, prev))
    }

    fn emit(&mut self, event: KvEvent) {
        self.watchers.retain(|_, w| {
            if !event.kv.key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(Ok(WatchMessage::Event(event.clone()))).is_ok()
        });
        self.events.insert(event.revision, event);
    }

    fn revoke(&mut self, lease_id: LeaseId) -> Option<usize> {
        let lease = self.leases.remove(&lease_id)?;
        let mut keys: Vec<_> = lease.attached_keys.into_iter().collect();
        keys.sort();
        let mut deleted = 0;
        for key in keys {
            if self.delete(&key).is_some() {
                deleted += 1;
            }
        }
        Some(deleted)
    }

    fn expire_due(&mut self, now: Tick) -> usize {
        let mut expired: Vec<LeaseId> = self
            .leases
            .values()
            .filter(|l| l.is_expired_at(now))
            .map(|l| l.lease_id)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        expired.sort_unstable();

        let mut deleted = 0;
        for lease_id in expired {
            let keys = self.revoke(lease_id).unwrap_or(0);
            tracing::debug!(lease_id, keys, "lease expired");
            deleted += keys;
        }
        deleted
    }

    fn compact(&mut self, revision: u64) -> usize {
        let floor = revision.min(self.revision);
        if floor <= self.compaction_floor {
            return 0;
        }

        let mut removed = 0;
        self.index.retain(|_, chain| {
            // Keep the newest entry at or below the floor so reads at the
            // floor still see it, unless it is a tombstone.
            let below = chain.iter().filter(|r| r.kv.mod_revision < floor).count();
            let keep_from = below.saturating_sub(1);
            let drop_last_below = below > 0 && chain[below - 1].is_deleted();
            let cut = if drop_last_below { below } else { keep_from };
            removed += cut;
            chain.drain(..cut);
            !chain.is_empty()
        });

        let stale: Vec<u64> = self.events.range(..floor).map(|(rev, _)| *rev).collect();
        for rev in stale {
            self.events.remove(&rev);
        }

        self.compaction_floor = floor;
        removed
    }
}

/// Statistics for a memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Current revision.
    pub revision: u64,
    /// Compaction floor.
    pub compaction_floor: u64,
    /// Number of live keys.
    pub live_keys: usize,
    /// Number of active leases.
    pub leases: usize,
    /// Number of registered watchers.
    pub watchers: usize,
}

/// Embedded store implementation.
///
/// Due leases are swept lazily: before every store call and on
/// [`MemoryStore::expire_due`]. An idle store emits no expiry events until
/// one of those runs, so whoever owns the store must call `expire_due`
/// periodically. [`crate::core::runtime::Runtime`] does this from its
/// maintenance task every `store.expiry_scan_period_ms`.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    injected_failures: AtomicU32,
}

impl MemoryStore {
    /// Create a store driven by tokio's monotonic clock.
    ///
    /// Lease expiry needs a periodic [`MemoryStore::expire_due`] to be
    /// observed by watchers of an otherwise idle store.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            clock,
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` store calls fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::Release);
    }

    /// Remove every lease whose deadline has passed, deleting attached keys.
    ///
    /// Returns the number of keys deleted.
    pub fn expire_due(&self) -> usize {
        let now = self.clock.now();
        self.state.lock().expire_due(now)
    }

    /// Discard history below `revision`.
    ///
    /// Returns the number of revision-chain entries removed.
    pub fn compact(&self, revision: u64) -> usize {
        let removed = self.state.lock().compact(revision);
        if removed > 0 {
            tracing::debug!(revision, removed, "store history compacted");
        }
        removed
    }

    /// Compact so that at most `retention` revisions of history remain.
    pub fn compact_retaining(&self, retention: u64) -> usize {
        let current = self.state.lock().revision;
        if retention == 0 || current <= retention {
            return 0;
        }
        self.compact(current - retention)
    }

    /// Fail every open watch with `Unavailable`, as a dropped connection
    /// would. Returns the number of watches closed.
    pub fn disconnect_watchers(&self) -> usize {
        let watchers: Vec<_> = self.state.lock().watchers.drain().collect();
        let count = watchers.len();
        for (_, watcher) in watchers {
            let _ = watcher
                .tx
                .send(Err(StoreError::unavailable("watch connection lost")));
        }
        count
    }

    /// Snapshot of a lease record.
    pub fn lease(&self, lease_id: LeaseId) -> Option<LeaseRecord> {
        self.state.lock().leases.get(&lease_id).cloned()
    }

    /// Current statistics.
    pub fn stats(&self) -> MemoryStoreStats {
        let state = self.state.lock();
        MemoryStoreStats {
            revision: state.revision,
            compaction_floor: state.compaction_floor,
            live_keys: state
                .index
                .values()
                .filter(|chain| chain.last().is_some_and(|r| !r.is_deleted()))
                .count(),
            leases: state.leases.len(),
            watchers: state.watchers.len(),
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::unavailable("injected failure")),
            Err(_) => Ok(()),
        }
    }

    /// Lock the state with due leases swept.
    fn lock_swept(&self) -> parking_lot::MutexGuard<'_, StoreState> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.expire_due(now);
        state
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn txn(&self, write: ConditionalWrite) -> StoreResult<TxnOutcome> {
        self.check_available()?;
        let mut state = self.lock_swept();

        if let WriteOp::Put {
            lease: LeaseAttachment::Attach(lease_id),
            ..
        } = &write.op
        {
            if !state.leases.contains_key(lease_id) {
                return Err(StoreError::LeaseNotFound {
                    lease_id: *lease_id,
                });
            }
        }

        let current = state.latest(&write.key).cloned();
        if !write.compare.matches(current.as_ref()) {
            return Ok(TxnOutcome::Failed {
                current,
                revision: state.revision,
            });
        }

        match write.op {
            WriteOp::Put { value, lease } => {
                let (revision, prev) = state.put(write.key, value, lease);
                Ok(TxnOutcome::Committed { revision, prev })
            }
            WriteOp::Delete => match state.delete(&write.key) {
                Some((revision, prev)) => Ok(TxnOutcome::Committed {
                    revision,
                    prev: Some(prev),
                }),
                None => Ok(TxnOutcome::Failed {
                    current: None,
                    revision: state.revision,
                }),
            },
        }
    }

    async fn get(&self, key: &[u8]) -> StoreResult<(Option<KeyValue>, u64)> {
        self.check_available()?;
        let state = self.lock_swept();
        Ok((state.latest(key).cloned(), state.revision))
    }

    async fn range(&self, request: RangeRequest) -> StoreResult<RangeResponse> {
        self.check_available()?;
        let state = self.lock_swept();

        let revision = match request.revision {
            Some(rev) if rev < state.compaction_floor => {
                return Err(StoreError::Compacted {
                    revision: rev,
                    compaction_floor: state.compaction_floor,
                });
            }
            Some(rev) if rev > state.revision => {
                return Err(StoreError::InvalidRequest {
                    message: format!(
                        "revision {} is ahead of current revision {}",
                        rev, state.revision
                    ),
                });
            }
            Some(rev) => rev,
            None => state.revision,
        };

        let mut kvs = Vec::new();
        let mut more = false;
        let candidates = state
            .index
            .range(request.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&request.prefix))
            .filter(|(k, _)| {
                request
                    .start_after
                    .as_ref()
                    .is_none_or(|after| k.as_slice() > after.as_slice())
            });
        for (key, _) in candidates {
            if let Some(kv) = state.at_revision(key, revision) {
                if request.limit > 0 && kvs.len() == request.limit {
                    more = true;
                    break;
                }
                kvs.push(kv.clone());
            }
        }

        Ok(RangeResponse {
            kvs,
            revision,
            more,
        })
    }

    async fn lease_grant(&self, ttl_seconds: u64) -> StoreResult<LeaseGrant> {
        self.check_available()?;
        if ttl_seconds == 0 {
            return Err(StoreError::InvalidRequest {
                message: "lease TTL must be > 0".to_string(),
            });
        }
        let now = self.clock.now();
        let mut state = self.lock_swept();
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state
            .leases
            .insert(id, LeaseRecord::new(id, ttl_seconds.saturating_mul(1000), now));
        Ok(LeaseGrant { id, ttl_seconds })
    }

    async fn lease_keep_alive(&self, lease_id: LeaseId) -> StoreResult<Option<u64>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.lock_swept();
        Ok(state.leases.get_mut(&lease_id).map(|lease| {
            lease.keepalive(now);
            lease.ttl_ms / 1000
        }))
    }

    async fn lease_revoke(&self, lease_id: LeaseId) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.lock_swept();
        state
            .revoke(lease_id)
            .map(|_| ())
            .ok_or(StoreError::LeaseNotFound { lease_id })
    }

    async fn watch(&self, prefix: &[u8], start_revision: Option<u64>) -> StoreResult<WatchStream> {
        self.check_available()?;
        let mut state = self.lock_swept();

        if let Some(start) = start_revision {
            if start < state.compaction_floor {
                return Err(StoreError::Compacted {
                    revision: start,
                    compaction_floor: state.compaction_floor,
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(start) = start_revision {
            for event in state.events.range(start..).map(|(_, e)| e) {
                if event.kv.key.starts_with(prefix) {
                    let _ = tx.send(Ok(WatchMessage::Event(event.clone())));
                }
            }
        }
        let _ = tx.send(Ok(WatchMessage::Synced {
            revision: state.revision,
        }));

        let id = state.next_watch_id;
        state.next_watch_id += 1;
        state.watchers.insert(
            id,
            Watcher {
                prefix: prefix.to_vec(),
                tx,
            },
        );
        Ok(WatchStream::new(id, rx))
    }

    fn cancel_watch(&self, watch_id: WatchId) {
        self.state.lock().watchers.remove(&watch_id);
    }

    async fn current_revision(&self) -> StoreResult<u64> {
        self.check_available()?;
        Ok(self.lock_swept().revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(state: &mut StoreState, key: &str, value: &str) -> u64 {
        state
            .put(key.into(), value.into(), LeaseAttachment::None)
            .0
    }

    #[test]
    fn compaction_keeps_latest_live_revision() {
        let mut state = StoreState::new();
        put(&mut state, "a", "1");
        put(&mut state, "a", "2");
        put(&mut state, "b", "1");
        state.delete(b"b");
        put(&mut state, "c", "1");

        state.compact(5);

        assert_eq!(state.compaction_floor, 5);
        assert_eq!(state.at_revision(b"a", 5).map(|kv| kv.value.clone()), Some(b"2".to_vec()));
        assert!(!state.index.contains_key(b"b".as_slice()));
        assert_eq!(state.events.keys().copied().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn expiry_deletes_each_key_at_its_own_revision() {
        let mut state = StoreState::new();
        state.leases.insert(7, LeaseRecord::new(7, 1_000, Tick::zero()));
        state.put(b"x".to_vec(), b"1".to_vec(), LeaseAttachment::Attach(7));
        state.put(b"y".to_vec(), b"1".to_vec(), LeaseAttachment::Attach(7));

        assert_eq!(state.expire_due(Tick::new(999)), 0);
        assert_eq!(state.expire_due(Tick::new(1_000)), 2);
        assert_eq!(state.revision, 4);
        assert_eq!(state.events[&3].kv.key, b"x");
        assert_eq!(state.events[&4].kv.key, b"y");
        assert!(state.leases.is_empty());
    }
}
