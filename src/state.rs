//! Durable per-collection sync state.
//!
//! One JSON file per collection under the configured state directory,
//! holding the page and attachment snapshots from the last completed pass.
//! Saves are atomic (temp file + rename) so a crash mid-write leaves either
//! the old or the new state readable. Malformed files fail closed with a
//! parse error instead of being treated as empty — a corrupt cache must
//! never silently turn into a full re-upload or, worse, a partial diff.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::models::CollectionState;

/// Filesystem-backed state store.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load the last persisted state for a collection, or an empty default
    /// when no state file exists yet.
    pub fn load(&self, collection: &str) -> SyncResult<CollectionState> {
        let path = self.path_for(collection);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CollectionState::empty(collection));
            }
            Err(err) => return Err(state_error(&path, err)),
        };

        serde_json::from_str(&raw).map_err(|err| SyncError::State {
            path,
            message: format!("malformed state: {err}"),
        })
    }

    /// Atomically replace the persisted state for a collection.
    pub fn save(&self, collection: &str, state: &CollectionState) -> SyncResult<()> {
        let path = self.path_for(collection);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| state_error(&path, err))?;
        }

        let json = serde_json::to_string_pretty(state).map_err(|err| SyncError::State {
            path: path.clone(),
            message: err.to_string(),
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|err| state_error(&tmp, err))?;
        fs::rename(&tmp, &path).map_err(|err| state_error(&path, err))?;
        Ok(())
    }

    /// Remove the cached state for a collection. Called only when a fresh
    /// destination collection was created, so reconciliation starts against
    /// an empty previous snapshot. Missing state is not an error.
    pub fn reset(&self, collection: &str) -> SyncResult<()> {
        let path = self.path_for(collection);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(state_error(&path, err)),
        }
    }

    /// Path of the state file backing a collection.
    pub fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(collection)))
    }
}

fn state_error(path: &Path, err: std::io::Error) -> SyncError {
    SyncError::State {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Collection names come from user config and source hostnames; keep the
/// file name to a conservative character set.
fn sanitize(collection: &str) -> String {
    collection
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
