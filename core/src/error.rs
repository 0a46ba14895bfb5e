//! Error taxonomy for the local store, the initialization controller and the
//! sync engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::EntityKind;

/// Why a local store could not be opened.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The persistent storage root could not be obtained or is not writable.
    #[error("persistent storage root unavailable: {0}")]
    PathUnavailable(String),

    /// A migration step failed; the file was left on its previous version.
    #[error("migration from schema v{from} to v{to} failed: {source}")]
    MigrationFailed {
        from: u32,
        to: u32,
        #[source]
        source: MigrationError,
    },

    /// The file was written by a newer build. Never retried.
    #[error("store {path} is at schema v{on_disk}, newer than supported v{supported}")]
    IncompatibleVersion {
        path: PathBuf,
        on_disk: u32,
        supported: u32,
    },

    /// The file exists but could not be opened or failed its integrity probe.
    #[error("store {path} could not be opened: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// Another live handle holds the store's lock file.
    #[error("store {0} is locked by another open handle")]
    Locked(PathBuf),
}

impl OpenError {
    /// Whether the initialization controller may try again after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::IncompatibleVersion { .. })
    }
}

/// A single schema migration step failed.
#[derive(Debug, Error)]
#[error("step v{version} ({description}): {source}")]
pub struct MigrationError {
    pub version: u32,
    pub description: &'static str,
    #[source]
    pub source: rusqlite::Error,
}

/// Errors from CRUD operations on an open store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("could not encode or decode a stored field: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },
}

impl StoreError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

/// Terminal and caller-visible outcomes of the initialization controller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("store initialization failed after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: u32, reason: String },

    #[error("store cannot be opened and will not be retried: {reason}")]
    Fatal { reason: String },

    #[error("store initialization was cancelled")]
    Cancelled,
}

/// Errors reported by a remote store implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network, timeout or server-side failure. Retryable.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// Validation or authorization failure. Not retryable.
    #[error("remote rejected the request: {0}")]
    Rejected(String),
}

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync not ready: {0}")]
    NotReady(&'static str),

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote rejected: {0}")]
    RemoteRejected(String),

    #[error("local store error: {0}")]
    Local(#[from] StoreError),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(msg) => Self::RemoteUnavailable(msg),
            RemoteError::Rejected(msg) => Self::RemoteRejected(msg),
        }
    }
}
