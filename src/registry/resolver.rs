//! Group/Version/Kind → keyspace resolution.
//!
//! The mapping is a table fixed at startup. Singular and plural spellings of
//! a kind are registered together and normalized (ASCII lower-case) at
//! registration time, so resolution is a single hash lookup and an
//! unregistered triple is an explicit `None`, never an empty prefix.

use super::model::Gvk;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Storage key prefix for every instance of one type.
///
/// Instances live at `"{keyspace}/{name}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keyspace(Arc<str>);

impl Keyspace {
    /// Create a keyspace, trimming trailing slashes. Empty prefixes are
    /// rejected.
    pub fn new(prefix: &str) -> Option<Self> {
        let trimmed = prefix.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(Arc::from(trimmed)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Range prefix covering every instance (`"{keyspace}/"`).
    pub fn prefix(&self) -> Vec<u8> {
        format!("{}/", self.0).into_bytes()
    }

    /// Storage key for a named instance.
    pub fn key_for(&self, name: &str) -> Vec<u8> {
        format!("{}/{}", self.0, name).into_bytes()
    }

    /// Instance name for a storage key directly inside this keyspace.
    ///
    /// Keys of a nested keyspace (`"{keyspace}/sub/name"`) are not instances.
    pub fn name_of<'k>(&self, key: &'k [u8]) -> Option<&'k str> {
        let rest = key.strip_prefix(self.0.as_bytes())?.strip_prefix(b"/")?;
        std::str::from_utf8(rest)
            .ok()
            .filter(|n| !n.is_empty() && !n.contains('/'))
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registered spellings of a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindNames {
    pub singular: String,
    pub plural: String,
}

impl KindNames {
    pub fn new(singular: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            singular: singular.into(),
            plural: plural.into(),
        }
    }

    /// Whether `kind` is either spelling, ignoring ASCII case.
    pub fn matches(&self, kind: &str) -> bool {
        self.singular.eq_ignore_ascii_case(kind) || self.plural.eq_ignore_ascii_case(kind)
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub keyspace: Keyspace,
    pub names: Arc<KindNames>,
}

/// Registration failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("empty keyspace for {0}")]
    EmptyKeyspace(Gvk),

    #[error("empty group, version or kind in {0}")]
    EmptyField(Gvk),

    #[error("{gvk} already maps to {existing}, cannot remap to {requested}")]
    Conflict {
        gvk: Gvk,
        existing: Keyspace,
        requested: Keyspace,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GvkKey {
    group: String,
    version: String,
    kind: String,
}

impl GvkKey {
    fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.trim().to_ascii_lowercase(),
            version: version.trim().to_ascii_lowercase(),
            kind: kind.trim().to_ascii_lowercase(),
        }
    }
}

/// Immutable lookup table from (group, version, kind) to keyspace.
#[derive(Debug, Clone, Default)]
pub struct KeyspaceResolver {
    table: HashMap<GvkKey, Resolved>,
}

impl KeyspaceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map both spellings of a kind to `keyspace`.
    ///
    /// Re-registering an identical mapping is a no-op.
    pub fn register(
        &mut self,
        group: &str,
        version: &str,
        names: KindNames,
        keyspace: &str,
    ) -> Result<(), RegistrationError> {
        let gvk = Gvk::new(group, version, names.singular.as_str());
        if group.trim().is_empty()
            || version.trim().is_empty()
            || names.singular.trim().is_empty()
            || names.plural.trim().is_empty()
        {
            return Err(RegistrationError::EmptyField(gvk));
        }
        let keyspace = Keyspace::new(keyspace).ok_or_else(|| RegistrationError::EmptyKeyspace(gvk.clone()))?;

        let keys = [
            GvkKey::new(group, version, &names.singular),
            GvkKey::new(group, version, &names.plural),
        ];
        for key in &keys {
            if let Some(existing) = self.table.get(key) {
                if existing.keyspace != keyspace {
                    return Err(RegistrationError::Conflict {
                        gvk: Gvk::new(group, version, key.kind.as_str()),
                        existing: existing.keyspace.clone(),
                        requested: keyspace,
                    });
                }
            }
        }

        let resolved = Resolved {
            keyspace,
            names: Arc::new(names),
        };
        for key in keys {
            self.table.insert(key, resolved.clone());
        }
        Ok(())
    }

    /// Resolve a triple. Pure lookup.
    pub fn resolve(&self, gvk: &Gvk) -> Option<&Resolved> {
        self.table
            .get(&GvkKey::new(&gvk.group, &gvk.version, &gvk.kind))
    }

    /// Number of distinct spellings registered.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Distinct keyspaces served.
    pub fn keyspaces(&self) -> Vec<Keyspace> {
        let mut spaces: Vec<_> = self.table.values().map(|r| r.keyspace.clone()).collect();
        spaces.sort();
        spaces.dedup();
        spaces
    }
}
