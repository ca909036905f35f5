//! Static-asset cache keyed by resource locator.
//!
//! Scripts and stylesheets are stored in a single JSON document, keyed by the
//! normalized path+query of their URL. Locators that carry a content hash or a
//! version parameter get a longer freshness window.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use url::Url;

use super::traits::ContentStats;
use crate::persist::write_atomic;

/// Freshness window for locators without a version marker
pub const UNVERSIONED_TTL_HOURS: i64 = 24;
/// Freshness window for versioned locators; also the garbage-collection age
pub const VERSIONED_TTL_HOURS: i64 = 48;

const VERSION_PARAMS: [&str; 3] = ["v", "hash", "version"];

/// Hex run of 8+ characters between dots, e.g. `app.3f9a1c2b.js`
static HASHED_NAME_REGEX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\.[0-9a-fA-F]{8,}\.").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
  Script,
  Stylesheet,
}

impl AssetKind {
  pub fn content_type(self) -> &'static str {
    match self {
      AssetKind::Script => "application/javascript",
      AssetKind::Stylesheet => "text/css",
    }
  }

  pub fn from_content_type(content_type: &str) -> Option<Self> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    match essence {
      "application/javascript" | "text/javascript" | "application/x-javascript" => {
        Some(AssetKind::Script)
      }
      "text/css" => Some(AssetKind::Stylesheet),
      _ => None,
    }
  }
}

/// One cached static resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentAsset {
  /// Normalized locator (also the map key)
  pub url: String,
  pub content_type: String,
  pub content: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  pub size: usize,
}

impl ContentAsset {
  pub fn kind(&self) -> Option<AssetKind> {
    AssetKind::from_content_type(&self.content_type)
  }

  pub fn versioned(&self) -> bool {
    is_versioned(&self.url)
  }

  fn freshness_window(&self) -> Duration {
    if self.versioned() {
      Duration::hours(VERSIONED_TTL_HOURS)
    } else {
      Duration::hours(UNVERSIONED_TTL_HOURS)
    }
  }
}

/// Reduce a URL to its path and query, the stable part used as a cache key.
pub fn normalize_locator(raw: &str) -> String {
  match Url::parse(raw) {
    Ok(url) => match url.query() {
      Some(q) => format!("{}?{}", url.path(), q),
      None => url.path().to_string(),
    },
    // Already relative; only drop the fragment
    Err(_) => raw.split('#').next().unwrap_or(raw).trim().to_string(),
  }
}

/// Whether the locator itself pins a specific version of the content.
pub fn is_versioned(locator: &str) -> bool {
  let (path, query) = match locator.split_once('?') {
    Some((p, q)) => (p, Some(q)),
    None => (locator, None),
  };

  if HASHED_NAME_REGEX.is_match(path) {
    return true;
  }

  query.is_some_and(|q| {
    q.split('&').any(|pair| {
      let name = pair.split('=').next().unwrap_or("");
      VERSION_PARAMS.iter().any(|p| p.eq_ignore_ascii_case(name))
    })
  })
}

/// Locator-keyed store of script and stylesheet bodies.
///
/// Every `set` is written through to disk immediately.
pub struct ContentCache {
  path: PathBuf,
  assets: BTreeMap<String, ContentAsset>,
  hits: u64,
  misses: u64,
  saved: u64,
}

impl ContentCache {
  /// Load the cache file, dropping entries older than the longest window.
  pub fn load(path: impl Into<PathBuf>) -> Self {
    Self::load_at(path, Utc::now())
  }

  pub fn load_at(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
    let path = path.into();
    let mut assets: BTreeMap<String, ContentAsset> = match std::fs::read(&path) {
      Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "content cache unreadable, starting empty");
        BTreeMap::new()
      }),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "content cache unreadable, starting empty");
        BTreeMap::new()
      }
    };

    let before = assets.len();
    let max_age = Duration::hours(VERSIONED_TTL_HOURS);
    assets.retain(|_, asset| now - asset.timestamp <= max_age);
    if assets.len() < before {
      debug!(dropped = before - assets.len(), "pruned expired content assets");
    }

    Self {
      path,
      assets,
      hits: 0,
      misses: 0,
      saved: 0,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn is_fresh(&self, locator: &str, kind: AssetKind) -> bool {
    self.is_fresh_at(locator, kind, Utc::now())
  }

  /// False when absent, stored under another kind, or past its window.
  pub fn is_fresh_at(&self, locator: &str, kind: AssetKind, now: DateTime<Utc>) -> bool {
    let key = normalize_locator(locator);
    match self.assets.get(&key) {
      Some(asset) => asset.kind() == Some(kind) && now - asset.timestamp <= asset.freshness_window(),
      None => false,
    }
  }

  pub fn get(&mut self, locator: &str, kind: AssetKind) -> Option<String> {
    self.get_at(locator, kind, Utc::now())
  }

  pub fn get_at(&mut self, locator: &str, kind: AssetKind, now: DateTime<Utc>) -> Option<String> {
    if !self.is_fresh_at(locator, kind, now) {
      self.misses += 1;
      return None;
    }

    self.hits += 1;
    self
      .assets
      .get(&normalize_locator(locator))
      .map(|a| a.content.clone())
  }

  pub fn set(&mut self, locator: &str, body: &str, kind: AssetKind) -> bool {
    self.set_at(locator, body, kind, Utc::now())
  }

  /// Store or replace the body for `locator` and persist right away.
  pub fn set_at(&mut self, locator: &str, body: &str, kind: AssetKind, now: DateTime<Utc>) -> bool {
    let key = normalize_locator(locator);
    self.assets.insert(
      key.clone(),
      ContentAsset {
        url: key,
        content_type: kind.content_type().to_string(),
        content: body.to_string(),
        timestamp: now,
        size: body.len(),
      },
    );
    self.saved += 1;
    self.persist()
  }

  /// Forget every asset and remove the backing file.
  pub fn clear(&mut self) {
    self.assets.clear();
    match std::fs::remove_file(&self.path) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove content cache"),
    }
  }

  pub fn stats(&self) -> ContentStats {
    ContentStats {
      hits: self.hits,
      misses: self.misses,
      saved: self.saved,
      total_size: self.assets.values().map(|a| a.size as u64).sum(),
      asset_count: self.assets.len(),
    }
  }

  pub fn log_stats(&self) {
    let s = self.stats();
    info!(
      hits = s.hits,
      misses = s.misses,
      saved = s.saved,
      total_size = s.total_size,
      assets = s.asset_count,
      "content cache"
    );
  }

  fn persist(&self) -> bool {
    let bytes = match serde_json::to_vec(&self.assets) {
      Ok(b) => b,
      Err(e) => {
        warn!(error = %e, "failed to serialize content cache");
        return false;
      }
    };

    match write_atomic(&self.path, &bytes) {
      Ok(()) => true,
      Err(e) => {
        warn!(path = %self.path.display(), error = %e, "failed to persist content cache");
        false
      }
    }
  }
}
