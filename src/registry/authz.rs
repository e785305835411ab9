//! Authorization gate.
//!
//! Every registry operation is checked here before it reaches the resolver
//! result, the store or the watch dispatcher. A denial is always reported as
//! `Forbidden`, whether or not the named resource exists and whether or not
//! the type is served.

use super::model::{Gvk, Identity, ResourceRef, Verb};
use super::resolver::KindNames;
use crate::core::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Input to an authorization decision.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    /// Type as spelled by the caller.
    pub gvk: &'a Gvk,
    pub verb: Verb,
    pub identity: &'a Identity,
    /// Registered spellings of the kind, when the type is served.
    pub names: Option<&'a KindNames>,
}

impl AccessRequest<'_> {
    /// Whether the request targets `kind`, under any registered spelling.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.gvk.kind.eq_ignore_ascii_case(kind) || self.names.is_some_and(|n| n.matches(kind))
    }

    /// Whether the request targets `group`.
    pub fn is_group(&self, group: &str) -> bool {
        self.gvk.group.eq_ignore_ascii_case(group)
    }
}

/// Authorization outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    #[default]
    Deny,
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Synchronous authorization predicate.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &AccessRequest<'_>) -> Decision;
}

impl<F> Authorizer for F
where
    F: Fn(&AccessRequest<'_>) -> bool + Send + Sync,
{
    fn authorize(&self, request: &AccessRequest<'_>) -> Decision {
        self(request).into()
    }
}

/// Allows everything. Used when no authorizer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _request: &AccessRequest<'_>) -> Decision {
        Decision::Allow
    }
}

/// One authorization rule. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub effect: Decision,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub versions: Vec<String>,
    /// Kinds, matched against every registered spelling.
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<Verb>,
    /// Subjects or, prefixed with `group:`, identity groups.
    #[serde(default)]
    pub subjects: Vec<String>,
}

impl Rule {
    fn matches(&self, request: &AccessRequest<'_>) -> bool {
        any_match(&self.groups, |g| request.is_group(g))
            && any_match(&self.versions, |v| request.gvk.version.eq_ignore_ascii_case(v))
            && any_match(&self.kinds, |k| request.is_kind(k))
            && (self.verbs.is_empty() || self.verbs.contains(&request.verb))
            && any_match(&self.subjects, |s| match s.strip_prefix("group:") {
                Some(group) => request.identity.groups.iter().any(|g| g == group),
                None => request.identity.subject == s,
            })
    }
}

fn any_match(list: &[String], pred: impl Fn(&str) -> bool) -> bool {
    list.is_empty() || list.iter().any(|s| pred(s))
}

/// First-match rule list with a default decision.
#[derive(Debug, Clone)]
pub struct RuleAuthorizer {
    default: Decision,
    rules: Vec<Rule>,
}

impl RuleAuthorizer {
    pub fn new(default: Decision, rules: Vec<Rule>) -> Self {
        Self { default, rules }
    }
}

impl Authorizer for RuleAuthorizer {
    fn authorize(&self, request: &AccessRequest<'_>) -> Decision {
        self.rules
            .iter()
            .find(|rule| rule.matches(request))
            .map_or(self.default, |rule| rule.effect)
    }
}

/// Gate wrapping the configured authorizer.
#[derive(Clone)]
pub struct AuthorizationGate {
    authorizer: Arc<dyn Authorizer>,
}

impl AuthorizationGate {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }

    /// Gate that allows everything.
    pub fn allow_all() -> Self {
        Self::new(Arc::new(AllowAll))
    }

    /// Check a request, failing with `Forbidden` on denial.
    pub fn check(&self, request: &AccessRequest<'_>, target: &ResourceRef) -> RegistryResult<()> {
        match self.authorizer.authorize(request) {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                tracing::debug!(
                    verb = %request.verb,
                    gvk = %request.gvk,
                    subject = %request.identity.subject,
                    "request denied"
                );
                Err(RegistryError::forbidden(request.verb, target.clone()))
            }
        }
    }
}

impl Default for AuthorizationGate {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl std::fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGate").finish_non_exhaustive()
    }
}
