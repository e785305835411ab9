//! Resource identity and record types.

use crate::store::LeaseId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Group/Version/Kind type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Identify a named instance of this type.
    pub fn named(&self, name: impl Into<String>) -> ResourceIdentity {
        ResourceIdentity {
            gvk: self.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

/// (group, version, kind, name) identity of a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub gvk: Gvk,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Gvk::new(group, version, kind).named(name)
    }

    /// Reference form used in errors.
    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef::named(self.gvk.clone(), self.name.clone())
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.gvk, self.name)
    }
}

/// A type, optionally narrowed to one name. Carried by every error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub gvk: Gvk,
    pub name: Option<String>,
}

impl ResourceRef {
    /// Reference to a whole type (LIST, WATCH).
    pub fn collection(gvk: Gvk) -> Self {
        Self { gvk, name: None }
    }

    /// Reference to a named instance.
    pub fn named(gvk: Gvk, name: impl Into<String>) -> Self {
        Self {
            gvk,
            name: Some(name.into()),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} {:?}", self.gvk, name),
            None => write!(f, "{}", self.gvk),
        }
    }
}

/// Registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Create,
    Get,
    List,
    Update,
    Delete,
    Watch,
}

impl Verb {
    /// All verbs.
    pub const ALL: [Verb; 6] = [
        Verb::Create,
        Verb::Get,
        Verb::List,
        Verb::Update,
        Verb::Delete,
        Verb::Watch,
    ];

    /// Whether the verb changes stored state.
    pub fn is_mutating(self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "CREATE",
            Verb::Get => "GET",
            Verb::List => "LIST",
            Verb::Update => "UPDATE",
            Verb::Delete => "DELETE",
            Verb::Watch => "WATCH",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown verb: {}", s))
    }
}

/// Caller identity, established by the transport layer.
///
/// The registry never interprets it beyond handing it to the authorizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Principal name.
    pub subject: String,
    /// Group memberships.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// Identity for unauthenticated callers.
    pub fn anonymous() -> Self {
        Self::new("system:anonymous")
    }
}

/// A stored resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub identity: ResourceIdentity,
    /// Structured document supplied by the caller.
    pub payload: serde_json::Value,
    /// Version token: the store revision of the last write.
    pub version: u64,
    /// Lease the record is attached to, if it expires.
    pub lease_id: Option<LeaseId>,
    /// Creation time, Unix milliseconds.
    pub created_at_ms: u64,
    /// Last modification time, Unix milliseconds.
    pub modified_at_ms: u64,
}

/// Kind of change in a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    /// Explicit delete or lease expiry; the two are indistinguishable.
    Deleted,
}

/// Change notification delivered to watch subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// Record after the change, or the last live state for `Deleted`.
    pub record: ResourceRecord,
    /// Store revision of the commit; strictly increasing per keyspace.
    pub sequence: u64,
}
