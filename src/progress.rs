//! Durable job cursor for resumable runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::persist::write_atomic;

#[derive(Debug, Error)]
pub enum ProgressError {
  #[error("failed to access progress file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("progress file {path} is corrupt: {source}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// What has been fully processed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
  /// Items downloaded, verified and deleted remotely
  #[serde(default)]
  pub completed_ids: BTreeSet<String>,
  /// Never decremented
  #[serde(default)]
  pub processed_count: u64,
  pub last_updated_at: Option<DateTime<Utc>>,
}

/// Progress record backed by a JSON file, flushed on every change.
///
/// Unlike the caches, a corrupt progress file is an error: silently starting
/// over would re-process and re-delete work the job already did.
#[derive(Debug)]
pub struct ProgressStore {
  path: PathBuf,
  state: ProgressState,
}

impl ProgressStore {
  /// Open the store at `path`; a missing file means a fresh job.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProgressError> {
    let path = path.into();
    let state = match std::fs::read(&path) {
      Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| ProgressError::Corrupt {
        path: path.clone(),
        source,
      })?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProgressState::default(),
      Err(source) => return Err(ProgressError::Io { path, source }),
    };

    Ok(Self { path, state })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn state(&self) -> &ProgressState {
    &self.state
  }

  pub fn is_completed(&self, id: &str) -> bool {
    self.state.completed_ids.contains(id)
  }

  /// Record `id` as completed and flush. Returns false if it was already recorded.
  pub fn record_completed(&mut self, id: &str) -> Result<bool, ProgressError> {
    if self.is_completed(id) {
      return Ok(false);
    }

    let mut next = self.state.clone();
    next.completed_ids.insert(id.to_string());
    next.processed_count += 1;
    next.last_updated_at = Some(Utc::now());

    // Only adopt the new state once it is on disk
    self.flush(&next)?;
    self.state = next;
    debug!(item_id = id, processed = self.state.processed_count, "progress recorded");

    Ok(true)
  }

  fn flush(&self, state: &ProgressState) -> Result<(), ProgressError> {
    let bytes = serde_json::to_vec_pretty(state).map_err(|source| ProgressError::Corrupt {
      path: self.path.clone(),
      source,
    })?;
    write_atomic(&self.path, &bytes).map_err(|source| ProgressError::Io {
      path: self.path.clone(),
      source,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_missing_file_is_empty_state() {
    let dir = TempDir::new().unwrap();
    let store = ProgressStore::open(dir.path().join("progress.json")).unwrap();
    assert_eq!(store.state(), &ProgressState::default());
  }

  #[test]
  fn test_record_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.json");

    let mut store = ProgressStore::open(&path).unwrap();
    assert!(store.record_completed("a").unwrap());
    assert!(store.record_completed("b").unwrap());

    let reopened = ProgressStore::open(&path).unwrap();
    assert!(reopened.is_completed("a"));
    assert!(reopened.is_completed("b"));
    assert_eq!(reopened.state().processed_count, 2);
    assert!(reopened.state().last_updated_at.is_some());
  }

  #[test]
  fn test_duplicate_record_does_not_count_twice() {
    let dir = TempDir::new().unwrap();
    let mut store = ProgressStore::open(dir.path().join("progress.json")).unwrap();

    assert!(store.record_completed("a").unwrap());
    assert!(!store.record_completed("a").unwrap());
    assert_eq!(store.state().processed_count, 1);
  }

  #[test]
  fn test_corrupt_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.json");
    std::fs::write(&path, b"{\"completedIds\": [").unwrap();

    let err = ProgressStore::open(&path).unwrap_err();
    assert!(matches!(err, ProgressError::Corrupt { .. }));
  }

  #[test]
  fn test_persisted_layout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.json");
    let mut store = ProgressStore::open(&path).unwrap();
    store.record_completed("item-1").unwrap();

    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["completedIds"], serde_json::json!(["item-1"]));
    assert_eq!(raw["processedCount"], 1);
    assert!(raw["lastUpdatedAt"].is_string());
  }
}
