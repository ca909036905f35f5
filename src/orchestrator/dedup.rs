//! Prefix fingerprints of verified artifacts, used to skip re-downloads on
//! resumed runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::persist::write_atomic;

/// Bytes hashed from the start of a file
pub const PREFIX_BYTES: u64 = 1024 * 1024;

/// Fingerprint of a local file: hex SHA-256 of its first [`PREFIX_BYTES`]
/// bytes, plus its full size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
  pub prefix_sha256: String,
  pub size: u64,
}

/// Fingerprint `path`, or `None` if it cannot be read.
pub async fn fingerprint(path: &Path) -> Option<Fingerprint> {
  let file = tokio::fs::File::open(path).await.ok()?;
  let size = file.metadata().await.ok()?.len();

  let mut prefix = Vec::with_capacity(PREFIX_BYTES.min(size) as usize);
  file.take(PREFIX_BYTES).read_to_end(&mut prefix).await.ok()?;

  Some(Fingerprint {
    prefix_sha256: hex::encode(Sha256::digest(&prefix)),
    size,
  })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerEntry {
  #[serde(flatten)]
  fingerprint: Fingerprint,
  recorded_at: DateTime<Utc>,
}

/// Artifact file name to the fingerprint it had when verified.
///
/// Advisory like the caches: an unreadable ledger starts empty, which only
/// costs a re-download.
#[derive(Debug)]
pub struct FingerprintLedger {
  path: PathBuf,
  entries: BTreeMap<String, LedgerEntry>,
}

impl FingerprintLedger {
  pub fn load(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let entries = match std::fs::read(&path) {
      Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "fingerprint ledger unreadable, starting empty");
        BTreeMap::new()
      }),
      Err(_) => BTreeMap::new(),
    };

    Self { path, entries }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn matches(&self, name: &str, fingerprint: &Fingerprint) -> bool {
    self
      .entries
      .get(name)
      .is_some_and(|e| e.fingerprint == *fingerprint)
  }

  /// Record and persist; returns false if the ledger could not be written.
  pub fn record(&mut self, name: &str, fingerprint: Fingerprint) -> bool {
    self.entries.insert(
      name.to_string(),
      LedgerEntry {
        fingerprint,
        recorded_at: Utc::now(),
      },
    );

    let written = serde_json::to_vec_pretty(&self.entries)
      .map_err(std::io::Error::other)
      .and_then(|bytes| write_atomic(&self.path, &bytes));
    match written {
      Ok(()) => {
        debug!(name, "fingerprint recorded");
        true
      }
      Err(e) => {
        warn!(name, error = %e, "failed to write fingerprint ledger");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[tokio::test]
  async fn test_fingerprint_covers_prefix_and_size() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.glb");
    let b = dir.path().join("b.glb");

    let mut data = vec![1u8; PREFIX_BYTES as usize + 10];
    std::fs::write(&a, &data).unwrap();
    // Differs only after the prefix
    data[PREFIX_BYTES as usize + 5] = 2;
    std::fs::write(&b, &data).unwrap();

    let fa = fingerprint(&a).await.unwrap();
    let fb = fingerprint(&b).await.unwrap();
    assert_eq!(fa, fb);
    assert_eq!(fa.size, PREFIX_BYTES + 10);

    std::fs::write(&b, &data[..100]).unwrap();
    assert_ne!(fingerprint(&b).await.unwrap(), fa);

    assert!(fingerprint(&dir.path().join("missing")).await.is_none());
  }

  #[tokio::test]
  async fn test_ledger_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("Chair_a1_1.glb");
    std::fs::write(&file, b"model").unwrap();
    let fp = fingerprint(&file).await.unwrap();

    let ledger_path = dir.path().join("fingerprints.json");
    let mut ledger = FingerprintLedger::load(&ledger_path);
    assert!(!ledger.matches("Chair_a1_1.glb", &fp));
    assert!(ledger.record("Chair_a1_1.glb", fp.clone()));

    let reloaded = FingerprintLedger::load(&ledger_path);
    assert_eq!(reloaded.len(), 1);
    assert!(reloaded.matches("Chair_a1_1.glb", &fp));
    assert!(!reloaded.matches("Chair_a1_2.glb", &fp));
  }

  #[test]
  fn test_corrupt_ledger_starts_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fingerprints.json");
    std::fs::write(&path, b"{not json").unwrap();

    assert!(FingerprintLedger::load(&path).is_empty());
  }
}
