//! The registry engine.
//!
//! - [`resolver`] - (group, version, kind) to keyspace mapping
//! - [`store`] - versioned CRUD with optimistic concurrency
//! - [`lease`] - TTL leases and keep-alive tasks
//! - [`watch`] - shared per-keyspace watches fanned out to subscribers
//! - [`authz`] - authorization gate
//! - [`facade`] - the single `execute` entry point composing the above

pub mod authz;
pub mod facade;
pub mod lease;
pub mod model;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod watch;

pub use authz::{AccessRequest, AllowAll, AuthorizationGate, Authorizer, Decision, Rule, RuleAuthorizer};
pub use facade::{ConfigError, Registry, RegistryConfig, RegistryConfigBuilder, Request, Response};
pub use lease::{KeepAlive, LeaseManager, LeasePlan, LeaseRequest};
pub use model::{EventKind, Gvk, Identity, ResourceIdentity, ResourceRecord, ResourceRef, Verb, WatchEvent};
pub use resolver::{KeyspaceResolver, Keyspace, KindNames, RegistrationError, Resolved};
pub use retry::RetryPolicy;
pub use store::{Created, ListOptions, ListPage, ResourceStore};
pub use watch::{WatchDispatcher, WatchState, WatchSubscription};
