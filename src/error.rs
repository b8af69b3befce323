// src/error.rs
//! Typed failures for the store and the source layer.
//!
//! Orchestration code wraps these in `anyhow::Error` with context; callers that
//! need to branch on a failure (conflicts, unknown kinds) can still downcast.

use thiserror::Error;

/// Failures raised by an [`EventStore`](crate::store::EventStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The conflict-retry budget ran out with records still unresolved.
    #[error("write conflict unresolved after {attempts} attempts for {} record(s): {}", ids.len(), ids.join(", "))]
    ConflictExhausted { attempts: usize, ids: Vec<String> },

    #[error("unknown storage backend '{0}' (available: couch, redis, memory)")]
    UnknownBackend(String),

    #[error("couchdb http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("malformed stored record '{id}': {reason}")]
    Malformed { id: String, reason: String },

    #[error("backend rejected write of '{id}': {reason}")]
    Rejected { id: String, reason: String },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Failures raised while configuring or resolving sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source kind '{0}'")]
    UnknownKind(String),

    #[error("invalid configuration for '{kind}': {reason}")]
    InvalidConfig { kind: String, reason: String },

    #[error("no source matching '{key}'{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    NoMatch {
        key: String,
        suggestion: Option<String>,
    },

    #[error("ambiguous source '{key}': {}", candidates.join(", "))]
    Ambiguous { key: String, candidates: Vec<String> },

    #[error("a source with id '{0}' already exists")]
    Duplicate(String),

    #[error("'{0}' cannot be changed once a source is created")]
    Immutable(String),

    #[error("source '{source_id}' is of kind '{actual}', expected '{expected}'")]
    WrongKind {
        source_id: String,
        expected: String,
        actual: String,
    },
}
