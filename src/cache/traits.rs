//! Core types shared by the caching components.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result from a cache-first fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, within its freshness window
  Cache,
}

/// Per-key counters of the disk cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
  pub hits: u64,
  pub misses: u64,
  /// Saves that replaced an existing entry
  pub refreshes: u64,
  pub errors: u64,
}

/// A swallowed cache failure, kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheError {
  pub key: String,
  pub reason: String,
  pub at: DateTime<Utc>,
}

/// Counters of the content cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentStats {
  pub hits: u64,
  pub misses: u64,
  pub saved: u64,
  /// Sum of cached body sizes in bytes
  pub total_size: u64,
  pub asset_count: usize,
}
