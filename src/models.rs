//! Core data types for the sync engine.
//!
//! These types flow between the source client, diff engine, state store,
//! and reconciler: versioned entity records, complete listings (snapshots),
//! the persisted per-collection state, and the pass report handed back to
//! callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two entity classes the source exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Page,
    Attachment,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Page => write!(f, "page"),
            EntityKind::Attachment => write!(f, "attachment"),
        }
    }
}

/// One page or attachment as observed in a source listing.
///
/// `version` is an opaque token (the source's last-modified timestamp).
/// The engine only ever compares versions for equality — a *different*
/// version means changed, not newer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub title: String,
    pub version: String,
    /// Owning page id, set for attachments only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            version: version.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// A complete listing of one entity class at one instant.
///
/// Snapshots are only constructed by exhausting source pagination; a
/// partially fetched listing is discarded, never wrapped in this type.
pub type Snapshot = Vec<EntityRecord>;

/// Durable record of the last successfully observed snapshots for one
/// collection. Overwritten wholesale at the end of each pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionState {
    pub collection: String,
    /// When the pass that produced this state finished.
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: Snapshot,
    #[serde(default)]
    pub attachments: Snapshot,
}

impl CollectionState {
    pub fn empty(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            saved_at: None,
            pages: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

/// Output of diffing two snapshots of one entity class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Present in current, absent from previous.
    pub added: Vec<EntityRecord>,
    /// Present in previous, absent from current.
    pub removed: Vec<EntityRecord>,
    /// Present in both with differing versions (current record kept).
    pub updated: Vec<EntityRecord>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Number of upload operations this diff implies.
    pub fn upsert_count(&self) -> usize {
        self.added.len() + self.updated.len()
    }
}

/// One entity that failed during the Applying phase.
#[derive(Debug, Clone, Serialize)]
pub struct FailedEntity {
    pub kind: EntityKind,
    pub id: String,
    pub name: String,
    pub error: String,
}

/// Summary of one sync pass, returned to the caller.
///
/// Per-entity failures are accumulated here rather than surfaced as raw
/// errors; a pass that reaches Persisting reports both lists.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub collection: String,
    /// Destination document names written or deleted this pass.
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedEntity>,
    pub pages_upserted: u64,
    pub pages_deleted: u64,
    pub attachments_upserted: u64,
    pub attachments_deleted: u64,
    /// Attachments skipped because no extractor handles them.
    pub skipped: u64,
    /// True when the pass stopped dispatching early due to cancellation.
    pub cancelled: bool,
}

impl SyncReport {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    pub fn total_writes(&self) -> u64 {
        self.pages_upserted
            + self.pages_deleted
            + self.attachments_upserted
            + self.attachments_deleted
    }
}
