//! Strata - generic resource registry.
//!
//! Strata serves arbitrarily-typed structured records, each identified by a
//! (group, version, kind, name) tuple, through one create/read/update/delete/
//! watch interface over a strongly-consistent key-value store. Callers
//! register the types they serve and the keyspace each maps to; the registry
//! handles optimistic concurrency, TTL expiry, change notification and
//! authorization uniformly, with no type-specific code.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Transport (out of crate)                      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │  Registry::execute
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Resolver → Authorization Gate → Resource Store │ Watch Fan-out │
//! │                                  Lease Manager                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │  KvStore
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        Key-value store: CAS │ Range │ Leases │ Watch             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Runtime orchestration
//! - [`core::time`] - Clocks
//! - [`core::error`] - Error types and codes
//!
//! ## Registry
//! - [`registry::resolver`] - GVK to keyspace mapping
//! - [`registry::store`] - Versioned CRUD
//! - [`registry::lease`] - Leases and keep-alive
//! - [`registry::watch`] - Watch dispatcher
//! - [`registry::authz`] - Authorization gate
//! - [`registry::facade`] - Entry point
//!
//! ## Store
//! - [`store`] - Key-value store contract
//! - [`store::memory`] - Embedded MVCC store
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Version tokens are store revisions and strictly increase per name, across
//!   delete and recreate.
//! - Every mutation is a single conditional write; stale writers fail.
//! - Authorization runs before the store or dispatcher is touched.
//! - Each keyspace has at most one store watch, shared by every subscriber.

// Core infrastructure
pub mod core;

// Registry engine
pub mod registry;

// Key-value store contract and embedded store
pub mod store;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use self::core::error::{ErrorCode, RegistryError, RegistryResult};
pub use registry::{
    Gvk, Identity, KindNames, LeaseRequest, ListOptions, Registry, RegistryConfig, Request,
    ResourceIdentity, ResourceRecord, Response, Verb, WatchEvent,
};
