//! Error taxonomy for the sync engine.
//!
//! Errors fall into two behavioral groups: pass-fatal (`Auth`,
//! `DuplicateEntity`, `SourceUnavailable` during listing) and per-entity
//! (`DestinationUnavailable` after retries are exhausted, `Extraction`).
//! The reconciler aborts on the former and accumulates the latter into the
//! pass report.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::EntityKind;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync pass.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The source or destination rejected our credentials (401/403).
    #[error("{service} rejected credentials: {message}")]
    Auth {
        /// Which service rejected us (`"source"` or `"destination"`).
        service: &'static str,
        message: String,
    },

    /// The source could not be listed or read. A partial listing is never
    /// trusted, so this aborts the pass when raised during Listing.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The destination failed after retries were exhausted, or failed with
    /// a non-retryable status.
    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),

    /// A single listing contained the same id twice. Indicates source
    /// inconsistency; diffing against such a snapshot would silently drop
    /// records, so the pass aborts instead.
    #[error("duplicate {kind} id {id} in one listing")]
    DuplicateEntity { kind: EntityKind, id: String },

    /// Content extraction failed for one attachment. The attachment is
    /// skipped and recorded; the pass continues.
    #[error("extraction failed for {name}: {message}")]
    Extraction { name: String, message: String },

    /// The local state file could not be read, parsed, or written.
    /// Malformed state fails closed rather than being treated as empty.
    #[error("state file {path}: {message}")]
    State { path: PathBuf, message: String },

    /// The pass was cancelled before any destructive operation.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid configuration detected at load time.
    #[error("config: {0}")]
    Config(String),
}

impl SyncError {
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable(message.into())
    }

    pub fn destination_unavailable(message: impl Into<String>) -> Self {
        Self::DestinationUnavailable(message.into())
    }

    pub fn extraction(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether the reconciler must abort the whole pass on this error, as
    /// opposed to recording it against one entity and continuing.
    pub fn is_pass_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth { .. }
                | SyncError::DuplicateEntity { .. }
                | SyncError::Cancelled
                | SyncError::Config(_)
        )
    }
}
