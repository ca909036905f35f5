//! Cache storage trait and the JSON-file disk implementation.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{CacheError, KeyStats};
use crate::persist::write_atomic;

/// Trait for cache storage backends.
///
/// Every operation is advisory: failures degrade to a miss (`None`) or `false`
/// and callers fall back to the uncached path.
pub trait CacheStorage: Send + Sync {
  /// Load a value, treating entries older than `ttl` as missing.
  fn load<T: DeserializeOwned>(&self, key: &str, ttl: Option<Duration>) -> Option<T>;

  /// Store a value, replacing any previous entry.
  fn save<T: Serialize>(&self, key: &str, value: &T) -> bool;

  /// Drop an entry.
  fn invalidate(&self, key: &str);
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn load<T: DeserializeOwned>(&self, _key: &str, _ttl: Option<Duration>) -> Option<T> {
    None // Always miss
  }

  fn save<T: Serialize>(&self, _key: &str, _value: &T) -> bool {
    false // Discard
  }

  fn invalidate(&self, _key: &str) {}
}

/// On-disk representation of one entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
  key: String,
  stored_at: DateTime<Utc>,
  payload: serde_json::Value,
}

/// Namespaced key to JSON store, one file per key.
///
/// Keys are conventionally `namespace:rest` (e.g. `remote:items`). The file
/// name is a hash of the full key; the key itself is kept inside the entry.
pub struct DiskCache {
  dir: PathBuf,
  stats: Mutex<BTreeMap<String, KeyStats>>,
  errors: Mutex<Vec<CacheError>>,
}

impl DiskCache {
  /// Create a cache rooted at `dir`. The directory is created on first save.
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      stats: Mutex::new(BTreeMap::new()),
      errors: Mutex::new(Vec::new()),
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Load `key` as of `now`. Entries older than `ttl` count as a miss.
  pub fn load_at<T: DeserializeOwned>(
    &self,
    key: &str,
    ttl: Option<Duration>,
    now: DateTime<Utc>,
  ) -> Option<T> {
    let Some(entry) = self.read_entry(key) else {
      self.bump(key, |s| s.misses += 1);
      return None;
    };

    if let Some(ttl) = ttl {
      if now - entry.stored_at > ttl {
        debug!(key, stored_at = %entry.stored_at, "cache entry stale");
        self.bump(key, |s| s.misses += 1);
        return None;
      }
    }

    match serde_json::from_value(entry.payload) {
      Ok(value) => {
        self.bump(key, |s| s.hits += 1);
        Some(value)
      }
      Err(e) => {
        self.record_error(key, format!("payload has unexpected shape: {e}"));
        self.bump(key, |s| s.misses += 1);
        None
      }
    }
  }

  /// Store `value` under `key`, stamped with `now`.
  pub fn save_at<T: Serialize>(&self, key: &str, value: &T, now: DateTime<Utc>) -> bool {
    let payload = match serde_json::to_value(value) {
      Ok(v) => v,
      Err(e) => {
        self.record_error(key, format!("serialize failed: {e}"));
        return false;
      }
    };

    let envelope = Envelope {
      key: key.to_string(),
      stored_at: now,
      payload,
    };
    let bytes = match serde_json::to_vec_pretty(&envelope) {
      Ok(b) => b,
      Err(e) => {
        self.record_error(key, format!("serialize failed: {e}"));
        return false;
      }
    };

    let path = self.entry_path(key);
    let existed = path.exists();
    match write_atomic(&path, &bytes) {
      Ok(()) => {
        if existed {
          self.bump(key, |s| s.refreshes += 1);
        }
        true
      }
      Err(e) => {
        self.record_error(key, format!("write failed: {e}"));
        false
      }
    }
  }

  /// Remove every file in the cache directory, including leftover temp files.
  pub fn clear_all(&self) {
    let entries = match std::fs::read_dir(&self.dir) {
      Ok(entries) => entries,
      Err(e) => {
        debug!(dir = %self.dir.display(), error = %e, "nothing to clear");
        return;
      }
    };

    for entry in entries.filter_map(|e| e.ok()) {
      let path = entry.path();
      if path.is_file() {
        if let Err(e) = std::fs::remove_file(&path) {
          warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
      }
    }
  }

  pub fn stats(&self) -> BTreeMap<String, KeyStats> {
    self
      .stats
      .lock()
      .map(|s| s.clone())
      .unwrap_or_default()
  }

  pub fn errors(&self) -> Vec<CacheError> {
    self
      .errors
      .lock()
      .map(|e| e.clone())
      .unwrap_or_default()
  }

  /// Report per-key counters and swallowed errors.
  pub fn log_stats(&self) {
    for (key, s) in self.stats() {
      info!(
        key = %key,
        hits = s.hits,
        misses = s.misses,
        refreshes = s.refreshes,
        errors = s.errors,
        "disk cache"
      );
    }
    for e in self.errors() {
      warn!(key = %e.key, at = %e.at, reason = %e.reason, "disk cache error");
    }
  }

  fn entry_path(&self, key: &str) -> PathBuf {
    // SHA256 hash for stable, fixed-length file names
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    self.dir.join(format!("{}.json", &digest[..32]))
  }

  fn read_entry(&self, key: &str) -> Option<Envelope> {
    let path = self.entry_path(key);
    let bytes = match std::fs::read(&path) {
      Ok(b) => b,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
      Err(e) => {
        self.record_error(key, format!("read failed: {e}"));
        return None;
      }
    };

    match serde_json::from_slice::<Envelope>(&bytes) {
      Ok(entry) if entry.key == key => Some(entry),
      Ok(entry) => {
        self.record_error(key, format!("file holds entry for `{}`", entry.key));
        None
      }
      Err(e) => {
        // Self-heal: a corrupt entry would otherwise fail on every load.
        self.record_error(key, format!("corrupt entry removed: {e}"));
        if let Err(e) = std::fs::remove_file(&path) {
          debug!(key, path = %path.display(), error = %e, "could not remove corrupt entry");
        }
        None
      }
    }
  }

  fn bump(&self, key: &str, f: impl FnOnce(&mut KeyStats)) {
    if let Ok(mut stats) = self.stats.lock() {
      f(stats.entry(key.to_string()).or_default());
    }
  }

  fn record_error(&self, key: &str, reason: String) {
    debug!(key, reason = %reason, "disk cache error");
    self.bump(key, |s| s.errors += 1);
    if let Ok(mut errors) = self.errors.lock() {
      errors.push(CacheError {
        key: key.to_string(),
        reason,
        at: Utc::now(),
      });
    }
  }
}

impl CacheStorage for DiskCache {
  fn load<T: DeserializeOwned>(&self, key: &str, ttl: Option<Duration>) -> Option<T> {
    self.load_at(key, ttl, Utc::now())
  }

  fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
    self.save_at(key, value, Utc::now())
  }

  fn invalidate(&self, key: &str) {
    match std::fs::remove_file(self.entry_path(key)) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => debug!(key, error = %e, "failed to invalidate cache entry"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::TempDir;

  fn cache() -> (TempDir, DiskCache) {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::new(dir.path().join("disk"));
    (dir, cache)
  }

  #[test]
  fn test_save_then_load() {
    let (_dir, cache) = cache();
    assert!(cache.save("remote:items", &vec!["a", "b"]));

    let loaded: Option<Vec<String>> = cache.load("remote:items", None);
    assert_eq!(loaded, Some(vec!["a".to_string(), "b".to_string()]));
    assert_eq!(cache.stats()["remote:items"].hits, 1);
  }

  #[test]
  fn test_missing_key_is_a_miss() {
    let (_dir, cache) = cache();
    let loaded: Option<u32> = cache.load("nope", Some(Duration::minutes(5)));
    assert_eq!(loaded, None);

    let stats = cache.stats()["nope"];
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.errors, 0);
  }

  #[test]
  fn test_ttl_expiry() {
    let (_dir, cache) = cache();
    let now = Utc::now();
    cache.save_at("k", &42u32, now - Duration::hours(2));

    assert_eq!(cache.load_at::<u32>("k", Some(Duration::minutes(60)), now), None);
    assert_eq!(
      cache.load_at::<u32>("k", Some(Duration::minutes(180)), now),
      Some(42)
    );
    // No ttl: this layer does not check age
    assert_eq!(cache.load_at::<u32>("k", None, now), Some(42));
  }

  #[test]
  fn test_corrupt_entry_is_removed() {
    let (_dir, cache) = cache();
    cache.save("k", &1u32);
    let path = cache.entry_path("k");
    std::fs::write(&path, b"{ not json").unwrap();

    assert_eq!(cache.load::<u32>("k", None), None);
    assert!(!path.exists());
    assert_eq!(cache.errors().len(), 1);
    assert!(cache.errors()[0].reason.contains("corrupt"));
  }

  #[test]
  fn test_wrong_payload_shape_is_a_miss() {
    let (_dir, cache) = cache();
    cache.save("k", &"text");
    assert_eq!(cache.load::<u32>("k", None), None);
    assert_eq!(cache.stats()["k"].errors, 1);
  }

  #[test]
  fn test_interrupted_save_keeps_previous_entry() {
    let (_dir, cache) = cache();
    assert!(cache.save("k", &"v1"));

    // A crash after writing part of the temp file but before the rename
    let mut tmp = tempfile::NamedTempFile::new_in(cache.dir()).unwrap();
    tmp.write_all(br#"{"key":"k","storedAt":"2024-"#).unwrap();
    let (_file, _kept) = tmp.keep().unwrap();

    assert_eq!(cache.load::<String>("k", None), Some("v1".to_string()));
  }

  #[test]
  fn test_overwrite_counts_refresh() {
    let (_dir, cache) = cache();
    cache.save("k", &1u32);
    cache.save("k", &2u32);

    assert_eq!(cache.stats()["k"].refreshes, 1);
    assert_eq!(cache.load::<u32>("k", None), Some(2));
  }

  #[test]
  fn test_invalidate_and_clear_all() {
    let (_dir, cache) = cache();
    cache.save("a", &1u32);
    cache.save("b", &2u32);

    cache.invalidate("a");
    cache.invalidate("never-stored");
    assert_eq!(cache.load::<u32>("a", None), None);
    assert_eq!(cache.load::<u32>("b", None), Some(2));

    cache.clear_all();
    assert_eq!(cache.load::<u32>("b", None), None);
    assert_eq!(std::fs::read_dir(cache.dir()).unwrap().count(), 0);
  }

  #[test]
  fn test_noop_storage_never_hits() {
    let storage = NoopStorage;
    assert!(!storage.save("k", &1u32));
    assert_eq!(storage.load::<u32>("k", None), None);
  }
}
