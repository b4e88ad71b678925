// File: rusty-collections/src/error.rs
// Purpose: Error types for the sync engine

use std::time::Duration;

use thiserror::Error;

use crate::driver::SyncPhase;

/// Failure deriving or parsing an entity key.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    /// The key string is not a serialized key object of this entity.
    #[error("malformed key {key:?}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("{entity} item is missing key field `{field}`")]
    MissingField { entity: String, field: String },

    #[error("{entity} key field `{field}` is invalid: {reason}")]
    InvalidField {
        entity: String,
        field: String,
        reason: String,
    },
}

/// A payload that does not conform to its entity schema.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {entity} message at `{path}`: {reason}")]
pub struct ValidationError {
    pub entity: String,
    pub path: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(entity: impl Into<String>, path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The call was cancelled on purpose (collection teardown).
    Canceled,
    Unavailable,
    DeadlineExceeded,
    InvalidArgument,
    NotFound,
    Unimplemented,
    Internal,
}

/// Error reported by the RPC transport.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Canceled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Internal, message)
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == TransportErrorKind::Canceled
    }
}

/// Fatal failure of a collection's sync driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("snapshot fetch failed: {0}")]
    Snapshot(TransportError),

    #[error("sync stream failed: {0}")]
    Stream(TransportError),

    #[error("sync stream ended without being cancelled")]
    StreamEnded,

    /// Torn down before the first snapshot was committed.
    #[error("sync cancelled before the first snapshot")]
    Cancelled,
}

/// Failure of a mutation or settle wait on a collection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("{entity} has no {operation} method")]
    Unsupported {
        entity: String,
        operation: &'static str,
    },

    #[error("{entity} was not confirmed by a sync batch within {waited:?}")]
    SettleTimeout { entity: String, waited: Duration },

    #[error("{entity} is no longer syncing ({phase:?})")]
    Unsynced { entity: String, phase: SyncPhase },

    #[error("collection closed")]
    Closed,
}

/// Invalid entity schema or catalog.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("entity name must not be empty")]
    EmptyName,

    #[error("{entity} declares no key fields")]
    EmptyKey { entity: String },

    #[error("{entity} key field `{field}` is not a declared field")]
    UnknownKeyField { entity: String, field: String },

    #[error("{entity} key field `{field}` cannot be a list or message")]
    UnkeyableField { entity: String, field: String },

    #[error("{entity} declares field `{field}` twice")]
    DuplicateField { entity: String, field: String },

    #[error("entity `{0}` is registered twice")]
    DuplicateEntity(String),

    #[error("{entity} is missing its {method} method")]
    MissingMethod { entity: String, method: &'static str },

    #[error("invalid method descriptor {0:?}, expected `service/method`")]
    InvalidMethod(String),
}

/// Failure reported by the collection registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("no collection registered for `{0}`")]
    UnknownEntity(String),

    #[error("{entity}: {source}")]
    Sync { entity: String, source: SyncError },

    #[error("{entity} driver task failed: {reason}")]
    Driver { entity: String, reason: String },

    #[error("{entity}: flushing paced updates failed: {source}")]
    Flush {
        entity: String,
        source: CollectionError,
    },
}
