//! Snapshot diffing.
//!
//! Pure comparison of two complete listings of one entity class. The
//! result partitions every id seen in either snapshot into exactly one of:
//! added, removed, updated, or untouched (absent from the result).

use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::models::{DiffResult, EntityKind, EntityRecord};

/// Compare a previous and a current snapshot keyed by entity id.
///
/// A record counts as updated when its id exists in both snapshots and the
/// version token differs; version tokens are opaque and only compared for
/// equality. Duplicate ids within a single snapshot indicate a broken
/// listing and fail fast rather than silently overwriting.
///
/// Ordering is deterministic: added/updated follow current-snapshot order,
/// removed follows previous-snapshot order.
pub fn diff(
    kind: EntityKind,
    previous: &[EntityRecord],
    current: &[EntityRecord],
) -> SyncResult<DiffResult> {
    let prev_by_id = index_by_id(kind, previous)?;
    let curr_by_id = index_by_id(kind, current)?;

    let mut result = DiffResult::default();

    for record in current {
        match prev_by_id.get(record.id.as_str()) {
            None => result.added.push(record.clone()),
            Some(old) if old.version != record.version => result.updated.push(record.clone()),
            Some(_) => {}
        }
    }

    for record in previous {
        if !curr_by_id.contains_key(record.id.as_str()) {
            result.removed.push(record.clone());
        }
    }

    Ok(result)
}

fn index_by_id<'a>(
    kind: EntityKind,
    snapshot: &'a [EntityRecord],
) -> SyncResult<HashMap<&'a str, &'a EntityRecord>> {
    let mut map = HashMap::with_capacity(snapshot.len());
    for record in snapshot {
        if map.insert(record.id.as_str(), record).is_some() {
            return Err(SyncError::DuplicateEntity {
                kind,
                id: record.id.clone(),
            });
        }
    }
    Ok(map)
}
