//! Registry entry point.
//!
//! Every request runs the same pipeline: resolve the type (a pure lookup),
//! authorize with the registered kind names in hand, and only then act on
//! the resolution. A denied request is `Forbidden` whether or not the type
//! is served or the record exists; the store is never touched for it.

use super::authz::{AccessRequest, AuthorizationGate, Authorizer};
use super::lease::{LeaseManager, LeaseRequest};
use super::model::{Gvk, Identity, ResourceIdentity, ResourceRecord, ResourceRef, Verb};
use super::resolver::{KeyspaceResolver, KindNames, RegistrationError, Resolved};
use super::retry::RetryPolicy;
use super::store::{Created, ListOptions, ListPage, ResourceStore};
use super::watch::{WatchDispatcher, WatchSubscription, DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY_CAPACITY};
use crate::core::error::{RegistryError, RegistryResult};
use crate::store::{KvStore, LeaseId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failures building a [`RegistryConfig`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("TTL policy for {0} names a type that is not served")]
    TtlForUnservedType(Gvk),

    #[error("TTL policy for {0} must be at least one second")]
    ZeroTtl(Gvk),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PolicyKey {
    group: String,
    version: String,
    kind: String,
}

impl PolicyKey {
    fn new(gvk: &Gvk, names: &KindNames) -> Self {
        Self {
            group: gvk.group.trim().to_ascii_lowercase(),
            version: gvk.version.trim().to_ascii_lowercase(),
            kind: names.singular.trim().to_ascii_lowercase(),
        }
    }
}

/// Immutable registry configuration: served types, TTL policies,
/// authorizer and tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    resolver: KeyspaceResolver,
    ttl_policies: HashMap<PolicyKey, u64>,
    authz: AuthorizationGate,
    retry: RetryPolicy,
    watch_channel_capacity: usize,
    watch_history_capacity: usize,
}

impl RegistryConfig {
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }

    pub fn resolver(&self) -> &KeyspaceResolver {
        &self.resolver
    }

    /// Registered TTL for a resolved type, if any.
    pub fn ttl_for(&self, gvk: &Gvk, resolved: &Resolved) -> Option<u64> {
        self.ttl_policies
            .get(&PolicyKey::new(gvk, &resolved.names))
            .copied()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }
}

/// Builder for [`RegistryConfig`].
#[derive(Debug)]
pub struct RegistryConfigBuilder {
    resolver: KeyspaceResolver,
    ttls: Vec<(Gvk, u64)>,
    authz: AuthorizationGate,
    retry: RetryPolicy,
    watch_channel_capacity: usize,
    watch_history_capacity: usize,
    error: Option<ConfigError>,
}

impl Default for RegistryConfigBuilder {
    fn default() -> Self {
        Self {
            resolver: KeyspaceResolver::new(),
            ttls: Vec::new(),
            authz: AuthorizationGate::allow_all(),
            retry: RetryPolicy::default(),
            watch_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            watch_history_capacity: DEFAULT_HISTORY_CAPACITY,
            error: None,
        }
    }
}

impl RegistryConfigBuilder {
    /// Serve a type under `keyspace`, by both spellings of its kind.
    pub fn serve(mut self, group: &str, version: &str, names: KindNames, keyspace: &str) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.resolver.register(group, version, names, keyspace) {
                self.error = Some(e.into());
            }
        }
        self
    }

    /// Give every record of a served type a lease with this TTL.
    ///
    /// Either spelling of the kind may be used.
    pub fn ttl(mut self, group: &str, version: &str, kind: &str, ttl_seconds: u64) -> Self {
        self.ttls.push((Gvk::new(group, version, kind), ttl_seconds));
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authz = AuthorizationGate::new(Arc::new(authorizer));
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How far a watch subscriber may fall behind before it is dropped.
    pub fn watch_channel_capacity(mut self, capacity: usize) -> Self {
        self.watch_channel_capacity = capacity;
        self
    }

    /// Events retained per shared watch for resuming subscribers.
    pub fn watch_history_capacity(mut self, capacity: usize) -> Self {
        self.watch_history_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<RegistryConfig, ConfigError> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let mut ttl_policies = HashMap::new();
        for (gvk, ttl_seconds) in self.ttls {
            let resolved = self
                .resolver
                .resolve(&gvk)
                .ok_or_else(|| ConfigError::TtlForUnservedType(gvk.clone()))?;
            if ttl_seconds == 0 {
                return Err(ConfigError::ZeroTtl(gvk));
            }
            ttl_policies.insert(PolicyKey::new(&gvk, &resolved.names), ttl_seconds);
        }

        Ok(RegistryConfig {
            resolver: self.resolver,
            ttl_policies,
            authz: self.authz,
            retry: self.retry,
            watch_channel_capacity: self.watch_channel_capacity,
            watch_history_capacity: self.watch_history_capacity,
        })
    }
}

/// A registry request, as handed over by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub verb: Verb,
    pub identity: Identity,
    pub gvk: Gvk,
    /// Required for CREATE, GET, UPDATE and DELETE.
    pub name: Option<String>,
    /// Required for CREATE and UPDATE.
    pub payload: Option<serde_json::Value>,
    /// Required for UPDATE, optional for DELETE.
    pub expected_version: Option<u64>,
    /// CREATE only.
    pub lease: LeaseRequest,
    /// WATCH only.
    pub from_revision: Option<u64>,
    /// LIST only.
    pub list: ListOptions,
}

impl Request {
    fn new(verb: Verb, identity: Identity, gvk: Gvk) -> Self {
        Self {
            verb,
            identity,
            gvk,
            name: None,
            payload: None,
            expected_version: None,
            lease: LeaseRequest::Default,
            from_revision: None,
            list: ListOptions::default(),
        }
    }

    fn named(verb: Verb, identity: Identity, resource: ResourceIdentity) -> Self {
        let mut request = Self::new(verb, identity, resource.gvk);
        request.name = Some(resource.name);
        request
    }

    pub fn create(identity: Identity, resource: ResourceIdentity, payload: serde_json::Value) -> Self {
        let mut request = Self::named(Verb::Create, identity, resource);
        request.payload = Some(payload);
        request
    }

    pub fn get(identity: Identity, resource: ResourceIdentity) -> Self {
        Self::named(Verb::Get, identity, resource)
    }

    pub fn list(identity: Identity, gvk: Gvk) -> Self {
        Self::new(Verb::List, identity, gvk)
    }

    pub fn update(
        identity: Identity,
        resource: ResourceIdentity,
        payload: serde_json::Value,
        expected_version: u64,
    ) -> Self {
        let mut request = Self::named(Verb::Update, identity, resource);
        request.payload = Some(payload);
        request.expected_version = Some(expected_version);
        request
    }

    pub fn delete(identity: Identity, resource: ResourceIdentity, expected_version: Option<u64>) -> Self {
        let mut request = Self::named(Verb::Delete, identity, resource);
        request.expected_version = expected_version;
        request
    }

    pub fn watch(identity: Identity, gvk: Gvk, from_revision: Option<u64>) -> Self {
        let mut request = Self::new(Verb::Watch, identity, gvk);
        request.from_revision = from_revision;
        request
    }

    pub fn with_lease(mut self, lease: LeaseRequest) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_list_options(mut self, options: ListOptions) -> Self {
        self.list = options;
        self
    }

    /// Reference used for errors about this request.
    pub fn target(&self) -> ResourceRef {
        ResourceRef {
            gvk: self.gvk.clone(),
            name: self.name.clone(),
        }
    }
}

/// Result of a successful request.
#[derive(Debug)]
pub enum Response {
    Created {
        version: u64,
        lease_id: Option<LeaseId>,
    },
    Record(ResourceRecord),
    List(ListPage),
    Updated {
        version: u64,
    },
    Deleted,
    Watch(WatchSubscription),
}

/// The registry facade.
pub struct Registry {
    config: Arc<RegistryConfig>,
    leases: Arc<LeaseManager>,
    resources: ResourceStore,
    watches: WatchDispatcher,
}

impl Registry {
    pub fn new(config: RegistryConfig, store: Arc<dyn KvStore>) -> Self {
        let leases = Arc::new(LeaseManager::new(Arc::clone(&store)));
        let resources = ResourceStore::new(Arc::clone(&store), Arc::clone(&leases), config.retry);
        let watches = WatchDispatcher::with_capacity(
            store,
            config.watch_channel_capacity,
            config.watch_history_capacity,
        );
        Self {
            config: Arc::new(config),
            leases,
            resources,
            watches,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Lease lifecycle, for components that keep their records alive.
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn watches(&self) -> &WatchDispatcher {
        &self.watches
    }

    /// Resolve a type without authorization. Used by tooling.
    pub fn resolve(&self, gvk: &Gvk) -> Option<&Resolved> {
        self.config.resolver.resolve(gvk)
    }

    /// Run one request through authorization, resolution and the store.
    pub async fn execute(&self, request: Request) -> RegistryResult<Response> {
        let verb = request.verb;
        let target = request.target();
        let resolved = self.config.resolver.resolve(&request.gvk);

        let access = AccessRequest {
            gvk: &request.gvk,
            verb,
            identity: &request.identity,
            names: resolved.map(|r| &*r.names),
        };
        self.config.authz.check(&access, &target)?;

        let resolved = resolved.ok_or_else(|| RegistryError::UnservedType {
            verb,
            target: target.clone(),
        })?;
        let keyspace = &resolved.keyspace;

        tracing::debug!(
            %verb,
            gvk = %request.gvk,
            name = request.name.as_deref().unwrap_or(""),
            subject = %request.identity.subject,
            %keyspace,
            "executing request"
        );

        match verb {
            Verb::List => {
                let page = self.resources.list(keyspace, &target, &request.list).await?;
                return Ok(Response::List(page));
            }
            Verb::Watch => {
                let subscription = self
                    .watches
                    .subscribe(keyspace, &request.gvk, request.from_revision)
                    .await?;
                return Ok(Response::Watch(subscription));
            }
            _ => {}
        }

        let Request {
            gvk,
            name,
            payload,
            expected_version,
            lease,
            ..
        } = request;
        let name = name.ok_or_else(|| RegistryError::invalid(verb, target.clone(), "name is required"))?;
        let resource = gvk.named(name);

        match verb {
            Verb::Create => {
                let payload = payload.ok_or_else(|| RegistryError::invalid(verb, target.clone(), "payload is required"))?;
                let plan = lease.plan(self.config.ttl_for(&resource.gvk, resolved));
                let Created { version, lease_id } = self.resources.create(keyspace, &resource, payload, plan).await?;
                Ok(Response::Created { version, lease_id })
            }
            Verb::Get => Ok(Response::Record(self.resources.get(keyspace, &resource).await?)),
            Verb::Update => {
                let payload = payload.ok_or_else(|| RegistryError::invalid(verb, target.clone(), "payload is required"))?;
                let expected = expected_version
                    .ok_or_else(|| RegistryError::invalid(verb, target.clone(), "expected version is required"))?;
                let version = self.resources.update(keyspace, &resource, payload, expected).await?;
                Ok(Response::Updated { version })
            }
            Verb::Delete => {
                self.resources.delete(keyspace, &resource, expected_version).await?;
                Ok(Response::Deleted)
            }
            Verb::List | Verb::Watch => Err(RegistryError::internal(verb, target, "unreachable verb dispatch")),
        }
    }

    pub async fn create(
        &self,
        identity: &Identity,
        resource: &ResourceIdentity,
        payload: serde_json::Value,
        lease: LeaseRequest,
    ) -> RegistryResult<Created> {
        let request = Request::create(identity.clone(), resource.clone(), payload).with_lease(lease);
        match self.execute(request).await? {
            Response::Created { version, lease_id } => Ok(Created { version, lease_id }),
            other => Err(unexpected(Verb::Create, resource.to_ref(), &other)),
        }
    }

    pub async fn get(&self, identity: &Identity, resource: &ResourceIdentity) -> RegistryResult<ResourceRecord> {
        match self.execute(Request::get(identity.clone(), resource.clone())).await? {
            Response::Record(record) => Ok(record),
            other => Err(unexpected(Verb::Get, resource.to_ref(), &other)),
        }
    }

    pub async fn list(&self, identity: &Identity, gvk: &Gvk, options: ListOptions) -> RegistryResult<ListPage> {
        let request = Request::list(identity.clone(), gvk.clone()).with_list_options(options);
        match self.execute(request).await? {
            Response::List(page) => Ok(page),
            other => Err(unexpected(Verb::List, ResourceRef::collection(gvk.clone()), &other)),
        }
    }

    pub async fn update(
        &self,
        identity: &Identity,
        resource: &ResourceIdentity,
        payload: serde_json::Value,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        let request = Request::update(identity.clone(), resource.clone(), payload, expected_version);
        match self.execute(request).await? {
            Response::Updated { version } => Ok(version),
            other => Err(unexpected(Verb::Update, resource.to_ref(), &other)),
        }
    }

    pub async fn delete(
        &self,
        identity: &Identity,
        resource: &ResourceIdentity,
        expected_version: Option<u64>,
    ) -> RegistryResult<()> {
        let request = Request::delete(identity.clone(), resource.clone(), expected_version);
        match self.execute(request).await? {
            Response::Deleted => Ok(()),
            other => Err(unexpected(Verb::Delete, resource.to_ref(), &other)),
        }
    }

    pub async fn watch(
        &self,
        identity: &Identity,
        gvk: &Gvk,
        from_revision: Option<u64>,
    ) -> RegistryResult<WatchSubscription> {
        match self.execute(Request::watch(identity.clone(), gvk.clone(), from_revision)).await? {
            Response::Watch(subscription) => Ok(subscription),
            other => Err(unexpected(Verb::Watch, ResourceRef::collection(gvk.clone()), &other)),
        }
    }
}

fn unexpected(verb: Verb, target: ResourceRef, response: &Response) -> RegistryError {
    RegistryError::internal(verb, target, format!("unexpected response: {:?}", response))
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("watches", &self.watches)
            .finish_non_exhaustive()
    }
}
