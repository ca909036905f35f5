//! Caching layer for API responses and static page assets.
//!
//! This module provides:
//! - A namespaced key to JSON disk cache with TTL freshness and per-key stats
//! - A locator-keyed content cache for scripts and stylesheets
//! - A cache-first fetch layer on top of any storage backend
//!
//! All caches are advisory. A failing cache behaves like an empty one.

mod content;
mod layer;
mod storage;
mod traits;

pub use content::{is_versioned, normalize_locator, AssetKind, ContentAsset, ContentCache};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, DiskCache, NoopStorage};
pub use traits::{CacheError, CacheResult, CacheSource, ContentStats, KeyStats};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

const DISK_DIR: &str = "disk";
const CONTENT_FILE: &str = "content-cache.json";

/// Owns both caches of one job directory.
///
/// Built once per job and handed to the components that need it.
#[derive(Clone)]
pub struct CacheManager {
  root: PathBuf,
  disk: Arc<DiskCache>,
  content: Arc<Mutex<ContentCache>>,
}

impl CacheManager {
  pub fn open(root: &Path) -> Self {
    Self {
      root: root.to_path_buf(),
      disk: Arc::new(DiskCache::new(root.join(DISK_DIR))),
      content: Arc::new(Mutex::new(ContentCache::load(root.join(CONTENT_FILE)))),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn disk(&self) -> Arc<DiskCache> {
    Arc::clone(&self.disk)
  }

  pub fn content(&self) -> Arc<Mutex<ContentCache>> {
    Arc::clone(&self.content)
  }

  /// Empty both caches.
  pub fn clear_all(&self) {
    self.disk.clear_all();
    match self.content.lock() {
      Ok(mut content) => content.clear(),
      Err(e) => warn!(error = %e, "content cache lock poisoned"),
    }
  }

  pub fn log_stats(&self) {
    self.disk.log_stats();
    if let Ok(content) = self.content.lock() {
      content.log_stats();
    }
  }
}
