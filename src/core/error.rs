//! Error types and transport-facing mapping.
//!
//! Every registry error carries the verb and the resource reference that
//! triggered it. Error codes returned by [`RegistryError::code`] are stable
//! string constants and part of the API contract.

use crate::registry::model::{ResourceRef, Verb};
use crate::store::StoreError;
use thiserror::Error;

/// Registry error conditions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The (group, version, kind) triple is not registered.
    #[error("{verb} {target}: resource type not served")]
    UnservedType { verb: Verb, target: ResourceRef },

    /// No live record with that name.
    #[error("{verb} {target}: not found")]
    NotFound { verb: Verb, target: ResourceRef },

    /// A live record with that name already exists.
    #[error("{verb} {target}: already exists")]
    AlreadyExists { verb: Verb, target: ResourceRef },

    /// Expected version does not match the stored one. Re-read and retry.
    #[error("{verb} {target}: version conflict (expected {expected}, current {current})")]
    VersionConflict {
        verb: Verb,
        target: ResourceRef,
        expected: u64,
        current: u64,
    },

    /// Denied by the authorization gate.
    ///
    /// Identical whether or not the resource exists.
    #[error("{verb} {target}: forbidden")]
    Forbidden { verb: Verb, target: ResourceRef },

    /// A watch subscriber fell behind the fan-out buffer.
    #[error("{verb} {target}: watch lagged behind by {skipped} events")]
    StreamLagged {
        verb: Verb,
        target: ResourceRef,
        skipped: u64,
    },

    /// A watch hit a gap it cannot resume across. Resubscribe.
    #[error("{verb} {target}: watch terminated: {reason}")]
    WatchTerminated {
        verb: Verb,
        target: ResourceRef,
        reason: String,
    },

    /// Transient connectivity failure to the underlying store.
    #[error("{verb} {target}: store unavailable: {message}")]
    StoreUnavailable {
        verb: Verb,
        target: ResourceRef,
        message: String,
    },

    /// Malformed request.
    #[error("{verb} {target}: invalid request: {message}")]
    InvalidRequest {
        verb: Verb,
        target: ResourceRef,
        message: String,
    },

    /// Internal error.
    #[error("{verb} {target}: internal error: {message}")]
    Internal {
        verb: Verb,
        target: ResourceRef,
        message: String,
    },
}

/// Stable error identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnservedType,
    NotFound,
    AlreadyExists,
    VersionConflict,
    Forbidden,
    StreamLagged,
    WatchTerminated,
    StoreUnavailable,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    /// Stable string constant.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnservedType => "UNSERVED_TYPE",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::Forbidden => "FORBIDDEN",
            Self::StreamLagged => "STREAM_LAGGED",
            Self::WatchTerminated => "WATCH_TERMINATED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status hint for the transport layer.
    pub fn http_status(self) -> u16 {
        match self {
            Self::UnservedType | Self::NotFound => 404,
            Self::AlreadyExists | Self::VersionConflict => 409,
            Self::Forbidden => 403,
            Self::StreamLagged | Self::WatchTerminated => 410,
            Self::StoreUnavailable => 503,
            Self::InvalidRequest => 400,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RegistryError {
    /// Create a Forbidden error.
    pub fn forbidden(verb: Verb, target: ResourceRef) -> Self {
        Self::Forbidden { verb, target }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(verb: Verb, target: ResourceRef, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            verb,
            target,
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(verb: Verb, target: ResourceRef, message: impl Into<String>) -> Self {
        Self::Internal {
            verb,
            target,
            message: message.into(),
        }
    }

    /// Translate a store failure into a registry error.
    pub fn from_store(verb: Verb, target: ResourceRef, error: StoreError) -> Self {
        match error {
            StoreError::Unavailable { message } => Self::StoreUnavailable {
                verb,
                target,
                message,
            },
            StoreError::Compacted { .. } if verb == Verb::Watch => Self::WatchTerminated {
                verb,
                target,
                reason: error.to_string(),
            },
            StoreError::Compacted { .. }
            | StoreError::LeaseNotFound { .. }
            | StoreError::InvalidRequest { .. } => Self::InvalidRequest {
                verb,
                target,
                message: error.to_string(),
            },
        }
    }

    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnservedType { .. } => ErrorCode::UnservedType,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::VersionConflict { .. } => ErrorCode::VersionConflict,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::StreamLagged { .. } => ErrorCode::StreamLagged,
            Self::WatchTerminated { .. } => ErrorCode::WatchTerminated,
            Self::StoreUnavailable { .. } => ErrorCode::StoreUnavailable,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Verb that triggered the error.
    pub fn verb(&self) -> Verb {
        match self {
            Self::UnservedType { verb, .. }
            | Self::NotFound { verb, .. }
            | Self::AlreadyExists { verb, .. }
            | Self::VersionConflict { verb, .. }
            | Self::Forbidden { verb, .. }
            | Self::StreamLagged { verb, .. }
            | Self::WatchTerminated { verb, .. }
            | Self::StoreUnavailable { verb, .. }
            | Self::InvalidRequest { verb, .. }
            | Self::Internal { verb, .. } => *verb,
        }
    }

    /// Resource the error refers to.
    pub fn target(&self) -> &ResourceRef {
        match self {
            Self::UnservedType { target, .. }
            | Self::NotFound { target, .. }
            | Self::AlreadyExists { target, .. }
            | Self::VersionConflict { target, .. }
            | Self::Forbidden { target, .. }
            | Self::StreamLagged { target, .. }
            | Self::WatchTerminated { target, .. }
            | Self::StoreUnavailable { target, .. }
            | Self::InvalidRequest { target, .. }
            | Self::Internal { target, .. } => target,
        }
    }

    /// Whether the registry may retry the operation on the caller's behalf.
    ///
    /// Only transient store failures qualify, and only for read-only verbs.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { verb, .. } if !verb.is_mutating())
    }
}

/// Result type using RegistryError.
pub type RegistryResult<T> = Result<T, RegistryError>;
