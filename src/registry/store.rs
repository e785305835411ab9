//! Keyed CRUD over a resolved keyspace.
//!
//! Every mutation is a single conditional write against the store's native
//! revision, so two writers holding the same expected version cannot both
//! succeed. Records are stored as a small JSON envelope carrying the payload
//! and its timestamps; the version token is never stored, it is always the
//! record's `mod_revision`.

use super::lease::{LeaseManager, LeasePlan};
use super::model::{ResourceIdentity, ResourceRecord, ResourceRef, Verb};
use super::resolver::Keyspace;
use super::retry::RetryPolicy;
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::time::unix_millis;
use crate::store::{
    ConditionalWrite, KeyValue, KvStore, LeaseId, RangeRequest, StoreError, TxnOutcome,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Longest accepted resource name.
pub const MAX_NAME_LEN: usize = 253;

/// Value layout under `"{keyspace}/{name}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredObject {
    pub payload: serde_json::Value,
    pub created_at_ms: u64,
    pub modified_at_ms: u64,
}

impl StoredObject {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Build a record from a stored pair.
pub(crate) fn decode_record(
    identity: ResourceIdentity,
    kv: &KeyValue,
) -> Result<ResourceRecord, serde_json::Error> {
    let object = StoredObject::decode(&kv.value)?;
    Ok(ResourceRecord {
        identity,
        payload: object.payload,
        version: kv.mod_revision,
        lease_id: kv.lease_id,
        created_at_ms: object.created_at_ms,
        modified_at_ms: object.modified_at_ms,
    })
}

/// Reject names that would escape or alias the keyspace.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name is longer than 253 bytes");
    }
    if name.contains('/') {
        return Err("name must not contain '/'");
    }
    if name.chars().any(char::is_control) {
        return Err("name must not contain control characters");
    }
    Ok(())
}

/// Result of a successful CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    pub version: u64,
    pub lease_id: Option<LeaseId>,
}

/// LIST paging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Maximum items per page (0 for everything).
    pub limit: usize,
    /// Token from the previous page.
    pub continue_token: Option<String>,
}

impl ListOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit,
            continue_token: None,
        }
    }
}

/// One page of a LIST.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
    /// Records ordered by name.
    pub items: Vec<ResourceRecord>,
    /// Store revision every item was read at.
    pub revision: u64,
    /// Present when more items remain.
    pub continue_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContinueToken {
    #[serde(rename = "rev")]
    revision: u64,
    #[serde(rename = "after")]
    last_name: String,
}

impl ContinueToken {
    fn encode(&self) -> Option<String> {
        serde_json::to_vec(self)
            .ok()
            .map(|json| URL_SAFE_NO_PAD.encode(json))
    }

    fn decode(token: &str) -> Option<Self> {
        let json = URL_SAFE_NO_PAD.decode(token).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

/// CRUD against the underlying store.
pub struct ResourceStore {
    store: Arc<dyn KvStore>,
    leases: Arc<LeaseManager>,
    retry: RetryPolicy,
}

impl ResourceStore {
    pub fn new(store: Arc<dyn KvStore>, leases: Arc<LeaseManager>, retry: RetryPolicy) -> Self {
        Self {
            store,
            leases,
            retry,
        }
    }

    fn check_name(verb: Verb, identity: &ResourceIdentity) -> RegistryResult<()> {
        validate_name(&identity.name)
            .map_err(|message| RegistryError::invalid(verb, identity.to_ref(), message))
    }

    /// Create a record that must not exist yet.
    ///
    /// A fresh lease is acquired before the write and revoked again if the
    /// write is definitely rejected.
    pub async fn create(
        &self,
        keyspace: &Keyspace,
        identity: &ResourceIdentity,
        payload: serde_json::Value,
        lease: Option<LeasePlan>,
    ) -> RegistryResult<Created> {
        const VERB: Verb = Verb::Create;
        Self::check_name(VERB, identity)?;
        let target = identity.to_ref();

        let now = unix_millis();
        let value = StoredObject {
            payload,
            created_at_ms: now,
            modified_at_ms: now,
        }
        .encode()
        .map_err(|e| RegistryError::invalid(VERB, target.clone(), e.to_string()))?;

        let (lease_id, fresh) = match lease {
            None => (None, false),
            Some(LeasePlan::Shared(id)) => (Some(id), false),
            Some(LeasePlan::Fresh { ttl_seconds }) => {
                let id = self
                    .leases
                    .acquire(ttl_seconds)
                    .await
                    .map_err(|e| RegistryError::from_store(VERB, target.clone(), e))?;
                (Some(id), true)
            }
        };

        let key = keyspace.key_for(&identity.name);
        let outcome = self
            .store
            .txn(ConditionalWrite::create(key, value, lease_id))
            .await;

        match outcome {
            Ok(TxnOutcome::Committed { revision, .. }) => {
                tracing::debug!(%keyspace, name = %identity.name, revision, ?lease_id, "record created");
                Ok(Created {
                    version: revision,
                    lease_id,
                })
            }
            Ok(TxnOutcome::Failed { .. }) => {
                if let (true, Some(id)) = (fresh, lease_id) {
                    self.release_lease(id).await;
                }
                Err(RegistryError::AlreadyExists {
                    verb: VERB,
                    target,
                })
            }
            // The write may or may not have committed; an orphaned lease
            // simply expires.
            Err(e) => Err(RegistryError::from_store(VERB, target, e)),
        }
    }

    async fn release_lease(&self, lease_id: LeaseId) {
        if let Err(e) = self.leases.revoke(lease_id).await {
            tracing::warn!(lease_id, error = %e, "failed to revoke unused lease");
        }
    }

    /// Read a record.
    pub async fn get(&self, keyspace: &Keyspace, identity: &ResourceIdentity) -> RegistryResult<ResourceRecord> {
        const VERB: Verb = Verb::Get;
        Self::check_name(VERB, identity)?;

        let key = &keyspace.key_for(&identity.name);
        let target = &identity.to_ref();
        let store = &self.store;
        let kv = self
            .retry
            .run(move || async move {
                store
                    .get(key)
                    .await
                    .map(|(kv, _)| kv)
                    .map_err(|e| RegistryError::from_store(VERB, target.clone(), e))
            })
            .await?;

        match kv {
            Some(kv) => decode_record(identity.clone(), &kv)
                .map_err(|e| RegistryError::internal(VERB, target.clone(), e.to_string())),
            None => Err(RegistryError::NotFound {
                verb: VERB,
                target: target.clone(),
            }),
        }
    }

    /// Replace the payload if the record is still at `expected_version`.
    ///
    /// The record keeps its lease and creation time.
    pub async fn update(
        &self,
        keyspace: &Keyspace,
        identity: &ResourceIdentity,
        payload: serde_json::Value,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        const VERB: Verb = Verb::Update;
        Self::check_name(VERB, identity)?;
        let target = identity.to_ref();
        let key = keyspace.key_for(&identity.name);

        let (current, _) = self
            .store
            .get(&key)
            .await
            .map_err(|e| RegistryError::from_store(VERB, target.clone(), e))?;
        let current = current.ok_or_else(|| RegistryError::NotFound {
            verb: VERB,
            target: target.clone(),
        })?;
        if current.mod_revision != expected_version {
            return Err(conflict(VERB, target, expected_version, &current));
        }

        let previous = StoredObject::decode(&current.value)
            .map_err(|e| RegistryError::internal(VERB, target.clone(), e.to_string()))?;
        let value = StoredObject {
            payload,
            created_at_ms: previous.created_at_ms,
            modified_at_ms: unix_millis(),
        }
        .encode()
        .map_err(|e| RegistryError::invalid(VERB, target.clone(), e.to_string()))?;

        match self
            .store
            .txn(ConditionalWrite::update(key, value, expected_version))
            .await
            .map_err(|e| RegistryError::from_store(VERB, target.clone(), e))?
        {
            TxnOutcome::Committed { revision, .. } => {
                tracing::debug!(%keyspace, name = %identity.name, revision, "record updated");
                Ok(revision)
            }
            TxnOutcome::Failed {
                current: Some(kv), ..
            } => Err(conflict(VERB, target, expected_version, &kv)),
            TxnOutcome::Failed { current: None, .. } => Err(RegistryError::NotFound {
                verb: VERB,
                target,
            }),
        }
    }

    /// Delete a record, optionally only at `expected_version`.
    pub async fn delete(
        &self,
        keyspace: &Keyspace,
        identity: &ResourceIdentity,
        expected_version: Option<u64>,
    ) -> RegistryResult<()> {
        const VERB: Verb = Verb::Delete;
        Self::check_name(VERB, identity)?;
        let target = identity.to_ref();
        let key = keyspace.key_for(&identity.name);

        match self
            .store
            .txn(ConditionalWrite::delete(key, expected_version))
            .await
            .map_err(|e| RegistryError::from_store(VERB, target.clone(), e))?
        {
            TxnOutcome::Committed { revision, .. } => {
                tracing::debug!(%keyspace, name = %identity.name, revision, "record deleted");
                Ok(())
            }
            TxnOutcome::Failed {
                current: Some(kv), ..
            } => Err(conflict(VERB, target, expected_version.unwrap_or_default(), &kv)),
            TxnOutcome::Failed { current: None, .. } => Err(RegistryError::NotFound {
                verb: VERB,
                target,
            }),
        }
    }

    /// Read one page of records, ordered by name.
    ///
    /// Every page of one listing is served at the revision of the first.
    pub async fn list(
        &self,
        keyspace: &Keyspace,
        target: &ResourceRef,
        options: &ListOptions,
    ) -> RegistryResult<ListPage> {
        const VERB: Verb = Verb::List;

        let token = match &options.continue_token {
            Some(raw) => Some(
                ContinueToken::decode(raw)
                    .ok_or_else(|| RegistryError::invalid(VERB, target.clone(), "malformed continue token"))?,
            ),
            None => None,
        };
        let request = &RangeRequest {
            prefix: keyspace.prefix(),
            start_after: token.as_ref().map(|t| keyspace.key_for(&t.last_name)),
            limit: options.limit,
            revision: token.as_ref().map(|t| t.revision),
        };

        let store = &self.store;
        let response = self
            .retry
            .run(move || async move {
                store.range(request.clone()).await.map_err(|e| match e {
                    StoreError::Compacted { .. } => {
                        RegistryError::invalid(VERB, target.clone(), "continue token expired")
                    }
                    e => RegistryError::from_store(VERB, target.clone(), e),
                })
            })
            .await?;

        let mut items = Vec::with_capacity(response.kvs.len());
        for kv in &response.kvs {
            let Some(name) = keyspace.name_of(&kv.key) else {
                continue;
            };
            let identity = target.gvk.named(name);
            let record = decode_record(identity, kv)
                .map_err(|e| RegistryError::internal(VERB, target.clone(), e.to_string()))?;
            items.push(record);
        }

        // Resume after the last key scanned, even when it was not an instance.
        let last_scanned = response
            .kvs
            .last()
            .and_then(|kv| kv.key.strip_prefix(request.prefix.as_slice()))
            .and_then(|rest| std::str::from_utf8(rest).ok());
        let continue_token = match (response.more, last_scanned) {
            (true, Some(last)) => ContinueToken {
                revision: response.revision,
                last_name: last.to_string(),
            }
            .encode(),
            _ => None,
        };

        Ok(ListPage {
            items,
            revision: response.revision,
            continue_token,
        })
    }
}

fn conflict(verb: Verb, target: ResourceRef, expected: u64, current: &KeyValue) -> RegistryError {
    RegistryError::VersionConflict {
        verb,
        target,
        expected,
        current: current.mod_revision,
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(validate_name("widget-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("tab\there").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn continue_token_round_trips() {
        let token = ContinueToken {
            revision: 42,
            last_name: "widget-7".into(),
        }
        .encode()
        .unwrap();
        let decoded = ContinueToken::decode(&token).unwrap();
        assert_eq!(decoded.revision, 42);
        assert_eq!(decoded.last_name, "widget-7");
        assert!(ContinueToken::decode("not base64!").is_none());
    }
}
