//! Watch fan-out.
//!
//! The dispatcher keeps an arena of shared watches, one per keyspace. Each
//! shared watch owns a single store watch, a pump task decoding its events
//! once, a broadcast channel to subscribers and a bounded window of recent
//! events. The arena lock is never held across an `.await`.
//!
//! `coverage` is the lowest revision a new subscriber can be served from
//! without the store: every event at or above it is either in the window or
//! will still be broadcast. A subscriber resuming below it is back-filled
//! from a short-lived store watch first.
//!
//! The last subscriber to leave removes the arena entry, cancels the store
//! watch and aborts the pump. A failed store watch terminates every
//! subscriber of its keyspace and removes the entry, so the next subscriber
//! starts afresh.

use super::model::{EventKind, Gvk, ResourceIdentity, ResourceRecord, ResourceRef, Verb, WatchEvent};
use super::resolver::Keyspace;
use super::store::StoredObject;
use crate::core::error::{RegistryError, RegistryResult};
use crate::store::{
    EventType, KvEvent, KvStore, LeaseId, StoreError, StoreResult, WatchId, WatchMessage, WatchStream,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Default per-subscriber fan-out buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default retained window per shared watch.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// An event decoded once per keyspace, before it is stamped with each
/// subscriber's requested type.
#[derive(Debug, Clone, PartialEq)]
struct KeyspaceEvent {
    kind: EventKind,
    sequence: u64,
    name: String,
    payload: serde_json::Value,
    version: u64,
    lease_id: Option<LeaseId>,
    created_at_ms: u64,
    modified_at_ms: u64,
}

impl KeyspaceEvent {
    fn decode(keyspace: &Keyspace, event: &KvEvent) -> Option<Self> {
        let name = keyspace.name_of(&event.kv.key)?;
        let object = match StoredObject::decode(&event.kv.value) {
            Ok(object) => object,
            Err(e) => {
                tracing::warn!(%keyspace, name, revision = event.revision, error = %e, "skipping undecodable record");
                return None;
            }
        };
        let kind = match event.event_type {
            EventType::Delete => EventKind::Deleted,
            EventType::Put if event.is_create() => EventKind::Created,
            EventType::Put => EventKind::Updated,
        };
        Some(Self {
            kind,
            sequence: event.revision,
            name: name.to_string(),
            payload: object.payload,
            version: event.kv.mod_revision,
            lease_id: event.kv.lease_id,
            created_at_ms: object.created_at_ms,
            modified_at_ms: object.modified_at_ms,
        })
    }

    fn stamp(&self, gvk: &Gvk) -> WatchEvent {
        WatchEvent {
            kind: self.kind,
            sequence: self.sequence,
            record: ResourceRecord {
                identity: ResourceIdentity {
                    gvk: gvk.clone(),
                    name: self.name.clone(),
                },
                payload: self.payload.clone(),
                version: self.version,
                lease_id: self.lease_id,
                created_at_ms: self.created_at_ms,
                modified_at_ms: self.modified_at_ms,
            },
        }
    }
}

#[derive(Debug, Clone)]
enum Delivery {
    Event(Arc<KeyspaceEvent>),
    Failed(Arc<str>),
}

struct SharedWatch {
    generation: u64,
    store_watch: WatchId,
    tx: broadcast::Sender<Delivery>,
    history: VecDeque<Arc<KeyspaceEvent>>,
    coverage: u64,
    subscribers: usize,
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn KvStore>,
    arena: Mutex<HashMap<Keyspace, SharedWatch>>,
    channel_capacity: usize,
    history_capacity: usize,
    next_generation: AtomicU64,
}

/// What a subscriber got when it joined a shared watch.
struct Joined {
    generation: u64,
    rx: broadcast::Receiver<Delivery>,
    backlog: VecDeque<Arc<KeyspaceEvent>>,
    coverage: u64,
}

impl Inner {
    /// Join an existing shared watch, if any.
    fn join(&self, keyspace: &Keyspace, from: u64) -> Option<Joined> {
        let mut arena = self.arena.lock();
        let shared = arena.get_mut(keyspace)?;
        shared.subscribers += 1;
        Some(Joined {
            generation: shared.generation,
            rx: shared.tx.subscribe(),
            backlog: shared
                .history
                .iter()
                .filter(|e| e.sequence >= from)
                .cloned()
                .collect(),
            coverage: shared.coverage,
        })
    }

    /// Install a shared watch around a freshly opened store watch, or hand
    /// the store watch back if another subscriber won the race.
    fn install(
        self: &Arc<Self>,
        keyspace: &Keyspace,
        coverage: u64,
        stream: WatchStream,
    ) -> Result<Joined, WatchStream> {
        let mut arena = self.arena.lock();
        if arena.contains_key(keyspace) {
            return Err(stream);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let store_watch = stream.id();
        let (tx, rx) = broadcast::channel(self.channel_capacity.max(1));
        let pump = tokio::spawn(pump(Arc::clone(self), keyspace.clone(), generation, stream));
        arena.insert(
            keyspace.clone(),
            SharedWatch {
                generation,
                store_watch,
                tx,
                history: VecDeque::new(),
                coverage,
                subscribers: 1,
                pump: Some(pump),
            },
        );
        tracing::info!(%keyspace, coverage, "shared watch opened");
        Ok(Joined {
            generation,
            rx,
            backlog: VecDeque::new(),
            coverage,
        })
    }

    fn publish(&self, keyspace: &Keyspace, generation: u64, event: KeyspaceEvent) {
        let mut arena = self.arena.lock();
        let Some(shared) = arena.get_mut(keyspace).filter(|s| s.generation == generation) else {
            return;
        };
        let event = Arc::new(event);
        shared.history.push_back(Arc::clone(&event));
        while shared.history.len() > self.history_capacity {
            if let Some(evicted) = shared.history.pop_front() {
                shared.coverage = evicted.sequence + 1;
            }
        }
        let _ = shared.tx.send(Delivery::Event(event));
    }

    fn fail(&self, keyspace: &Keyspace, generation: u64, reason: String) {
        let removed = {
            let mut arena = self.arena.lock();
            match arena.get(keyspace) {
                Some(shared) if shared.generation == generation => arena.remove(keyspace),
                _ => None,
            }
        };
        if let Some(shared) = removed {
            tracing::error!(%keyspace, subscribers = shared.subscribers, %reason, "shared watch failed");
            let _ = shared.tx.send(Delivery::Failed(Arc::from(reason)));
            self.store.cancel_watch(shared.store_watch);
        }
    }

    fn leave(&self, keyspace: &Keyspace, generation: u64) {
        let removed = {
            let mut arena = self.arena.lock();
            match arena.get_mut(keyspace) {
                Some(shared) if shared.generation == generation => {
                    shared.subscribers -= 1;
                    if shared.subscribers == 0 {
                        arena.remove(keyspace)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(shared) = removed {
            self.store.cancel_watch(shared.store_watch);
            if let Some(pump) = shared.pump {
                pump.abort();
            }
            tracing::info!(%keyspace, "shared watch closed");
        }
    }
}

/// Drain one store watch into its shared watch until it fails.
async fn pump(inner: Arc<Inner>, keyspace: Keyspace, generation: u64, mut stream: WatchStream) {
    loop {
        match stream.recv().await {
            Some(Ok(WatchMessage::Event(event))) => {
                if let Some(decoded) = KeyspaceEvent::decode(&keyspace, &event) {
                    inner.publish(&keyspace, generation, decoded);
                }
            }
            Some(Ok(WatchMessage::Synced { .. })) => {}
            Some(Err(e)) => {
                inner.fail(&keyspace, generation, e.to_string());
                return;
            }
            None => {
                inner.fail(&keyspace, generation, "store watch closed".to_string());
                return;
            }
        }
    }
}

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Subscribed, nothing delivered yet.
    Init,
    /// At least one event delivered.
    Streaming,
    /// Closed by the subscriber.
    Closed,
    /// Ended by lag or a failed store watch.
    Errored,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WatchState::Closed | WatchState::Errored)
    }
}

/// One subscriber's handle.
///
/// Dropping it unsubscribes.
pub struct WatchSubscription {
    inner: Arc<Inner>,
    keyspace: Keyspace,
    gvk: Gvk,
    generation: u64,
    rx: broadcast::Receiver<Delivery>,
    backlog: VecDeque<Arc<KeyspaceEvent>>,
    /// Next revision this subscriber expects.
    cursor: u64,
    state: WatchState,
    attached: bool,
}

impl WatchSubscription {
    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Next event, or `None` once the subscription has ended.
    ///
    /// Lag and store failures are returned once as errors, after which the
    /// subscription is `Errored`.
    pub async fn recv(&mut self) -> Option<RegistryResult<WatchEvent>> {
        if self.state.is_terminal() {
            return None;
        }
        while let Some(event) = self.backlog.pop_front() {
            if event.sequence >= self.cursor {
                return Some(Ok(self.deliver(&event)));
            }
        }
        loop {
            match self.rx.recv().await {
                Ok(Delivery::Event(event)) if event.sequence < self.cursor => continue,
                Ok(Delivery::Event(event)) => return Some(Ok(self.deliver(&event))),
                Ok(Delivery::Failed(reason)) => {
                    return Some(Err(self.terminate(RegistryError::WatchTerminated {
                        verb: Verb::Watch,
                        target: self.target(),
                        reason: reason.to_string(),
                    })));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(keyspace = %self.keyspace, skipped, "watch subscriber lagged");
                    return Some(Err(self.terminate(RegistryError::StreamLagged {
                        verb: Verb::Watch,
                        target: self.target(),
                        skipped,
                    })));
                }
                Err(RecvError::Closed) => {
                    return Some(Err(self.terminate(RegistryError::WatchTerminated {
                        verb: Verb::Watch,
                        target: self.target(),
                        reason: "shared watch closed".to_string(),
                    })));
                }
            }
        }
    }

    /// Unsubscribe now.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = WatchState::Closed;
        }
        self.detach();
    }

    fn deliver(&mut self, event: &KeyspaceEvent) -> WatchEvent {
        self.cursor = event.sequence + 1;
        self.state = WatchState::Streaming;
        event.stamp(&self.gvk)
    }

    fn terminate(&mut self, error: RegistryError) -> RegistryError {
        self.state = WatchState::Errored;
        self.backlog.clear();
        self.detach();
        error
    }

    fn target(&self) -> ResourceRef {
        ResourceRef::collection(self.gvk.clone())
    }

    fn detach(&mut self) {
        if std::mem::take(&mut self.attached) {
            self.inner.leave(&self.keyspace, self.generation);
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("keyspace", &self.keyspace)
            .field("gvk", &self.gvk)
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish()
    }
}

/// Fans one store watch per keyspace out to any number of subscribers.
#[derive(Clone)]
pub struct WatchDispatcher {
    inner: Arc<Inner>,
}

impl WatchDispatcher {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_capacity(store, DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY_CAPACITY)
    }

    /// `channel_capacity` bounds how far a subscriber may fall behind;
    /// `history_capacity` bounds the retained window.
    pub fn with_capacity(store: Arc<dyn KvStore>, channel_capacity: usize, history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                arena: Mutex::new(HashMap::new()),
                channel_capacity,
                history_capacity,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to `keyspace`, stamping events with `gvk`.
    ///
    /// Without `from_revision` only changes after the current revision are
    /// delivered. With it, delivery starts exactly at that revision.
    pub async fn subscribe(
        &self,
        keyspace: &Keyspace,
        gvk: &Gvk,
        from_revision: Option<u64>,
    ) -> RegistryResult<WatchSubscription> {
        let target = ResourceRef::collection(gvk.clone());
        let store_error = |e: StoreError| RegistryError::from_store(Verb::Watch, target.clone(), e);

        let from = match from_revision {
            Some(revision) => revision,
            None => self.inner.store.current_revision().await.map_err(store_error)? + 1,
        };

        let joined = match self.inner.join(keyspace, from) {
            Some(joined) => joined,
            None => {
                let stream = self
                    .inner
                    .store
                    .watch(&keyspace.prefix(), Some(from))
                    .await
                    .map_err(store_error)?;
                // A start above the current revision still receives every
                // later commit, so coverage cannot exceed the revision read
                // after the watch was opened.
                let coverage = match from_revision {
                    Some(_) => match self.inner.store.current_revision().await {
                        Ok(current) => from.min(current + 1),
                        Err(e) => {
                            self.inner.store.cancel_watch(stream.id());
                            return Err(store_error(e));
                        }
                    },
                    None => from,
                };
                match self.inner.install(keyspace, coverage, stream) {
                    Ok(joined) => joined,
                    Err(stream) => {
                        self.inner.store.cancel_watch(stream.id());
                        self.inner.join(keyspace, from).ok_or_else(|| {
                            RegistryError::internal(Verb::Watch, target.clone(), "shared watch vanished while joining")
                        })?
                    }
                }
            }
        };

        let mut subscription = WatchSubscription {
            inner: Arc::clone(&self.inner),
            keyspace: keyspace.clone(),
            gvk: gvk.clone(),
            generation: joined.generation,
            rx: joined.rx,
            backlog: joined.backlog,
            cursor: from,
            state: WatchState::Init,
            attached: true,
        };

        if from < joined.coverage {
            // Dropping `subscription` on error unsubscribes.
            let older = self
                .backfill(keyspace, from, joined.coverage)
                .await
                .map_err(store_error)?;
            for event in older.into_iter().rev() {
                subscription.backlog.push_front(event);
            }
        }

        tracing::debug!(%keyspace, from_revision = from, "watch subscribed");
        Ok(subscription)
    }

    /// Events in `[from, until)` replayed from the store.
    async fn backfill(
        &self,
        keyspace: &Keyspace,
        from: u64,
        until: u64,
    ) -> StoreResult<Vec<Arc<KeyspaceEvent>>> {
        let mut stream = self.inner.store.watch(&keyspace.prefix(), Some(from)).await?;
        let mut events = Vec::new();
        let result = loop {
            match stream.recv().await {
                Some(Ok(WatchMessage::Event(event))) if event.revision < until => {
                    if let Some(decoded) = KeyspaceEvent::decode(keyspace, &event) {
                        events.push(Arc::new(decoded));
                    }
                }
                Some(Ok(WatchMessage::Event(_))) | Some(Ok(WatchMessage::Synced { .. })) => break Ok(()),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        self.inner.store.cancel_watch(stream.id());
        result.map(|_| events)
    }

    /// Number of keyspaces with a live shared watch.
    pub fn shared_watches(&self) -> usize {
        self.inner.arena.lock().len()
    }

    /// Subscribers currently attached to `keyspace`.
    pub fn subscribers(&self, keyspace: &Keyspace) -> usize {
        self.inner
            .arena
            .lock()
            .get(keyspace)
            .map_or(0, |shared| shared.subscribers)
    }
}

impl std::fmt::Debug for WatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchDispatcher")
            .field("shared_watches", &self.shared_watches())
            .field("channel_capacity", &self.inner.channel_capacity)
            .field("history_capacity", &self.inner.history_capacity)
            .finish()
    }
}
