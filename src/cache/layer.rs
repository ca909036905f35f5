//! Cache layer that puts a storage backend in front of a fetcher.

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::storage::CacheStorage;
use super::traits::CacheResult;

/// Cache-first fetching over any [`CacheStorage`].
///
/// Fresh entries are served without calling the fetcher; stale or missing
/// entries are fetched and stored. Fetch errors are returned as-is, since a
/// stale answer would hide the failure from callers that need to see it.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Fetch a value with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch
  /// 3. Store the fetched value (best-effort)
  pub async fn fetch<T, E, F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheResult<T>, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    if let Some(cached) = self.storage.load::<T>(key, Some(self.stale_time)) {
      debug!(key, "serving from cache");
      return Ok(CacheResult::from_cache(cached));
    }

    let data = fetcher().await?;
    if !self.storage.save(key, &data) {
      debug!(key, "fetched value not cached");
    }
    Ok(CacheResult::from_network(data))
  }

  /// Drop the entry for `key` so the next fetch goes to the network.
  pub fn invalidate(&self, key: &str) {
    self.storage.invalidate(key);
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      stale_time: self.stale_time,
    }
  }
}
