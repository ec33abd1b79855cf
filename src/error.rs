// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are categorized by their source (remote HTTP, local storage,
//! checkpoint SQLite, etc.) and carry enough context to be surfaced as the
//! replicator's single `last_error`.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Network` | Yes | Timeouts, connection resets |
//! | `Http` (5xx, 408, 429) | Yes | Remote temporarily unavailable |
//! | `Http` (401, 403) | No | Auth failure, terminal for the replicator |
//! | `Http` (other 4xx) | No | Protocol-level rejection |
//! | `Forbidden` | No | Insert rejected by validation; skipped and counted |
//! | `Storage` | No | Local transaction failed and was rolled back |
//! | `CheckpointStore` | No | Local SQLite errors |
//! | `InvalidRevision` | No | Malformed rev ID or revision history |
//! | `Json` | No | Malformed JSON body |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Replicator state machine violation |
//! | `Shutdown` | No | Replicator is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! Conflicts are deliberately absent: concurrent edits are recorded in the
//! revision tree and are never an error.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Remote answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never produced a response (timeout, reset, DNS).
    #[error("Network error: {0}")]
    Network(String),

    /// SQLite error during local checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// A storage transaction failed and was rolled back.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation rejected a revision.
    #[error("Forbidden: {doc_id} {rev_id}")]
    Forbidden { doc_id: String, rev_id: String },

    /// Malformed revision ID or `_revisions` history.
    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    /// Malformed JSON body.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create an HTTP error for a status code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for the given HTTP status.
    pub fn is_status(&self, code: u16) -> bool {
        self.status() == Some(code)
    }

    /// 401 or 403 from the remote.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::CheckpointStore(_) => false,
            Self::Storage(_) => false,
            Self::Forbidden { .. } => false,
            Self::InvalidRevision(_) => false,
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

/// Per-item outcome of a storage write.
///
/// Transaction-level failures are reported as `Err(ReplicationError::Storage)`
/// instead; a `Status` always means the transaction itself is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NotFound,
    Conflict,
    Forbidden,
    BadRequest,
    DbError,
}

impl Status {
    pub fn is_successful(self) -> bool {
        matches!(self, Status::Ok | Status::Created)
    }

    /// HTTP-equivalent code.
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::Conflict => 409,
            Status::DbError => 590,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
