//! Domain types for remote work items.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque identifier assigned by the remote system
pub type ItemId = String;

/// Generation status of a variant on the remote side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantStatus {
  #[default]
  Pending,
  Success,
  Failed,
}

/// One rendition of an item, downloadable in several formats
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
  pub status: VariantStatus,
  /// Format name (glb, obj, usdz, ...) to source URL
  #[serde(default)]
  pub urls_by_format: BTreeMap<String, String>,
}

impl Variant {
  pub fn is_ready(&self) -> bool {
    self.status == VariantStatus::Success
  }

  pub fn url_for(&self, format: &str) -> Option<&str> {
    self.urls_by_format.get(format).map(String::as_str)
  }
}

/// A remote work unit with its variants in listed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
  pub id: ItemId,
  pub title: String,
  #[serde(default)]
  pub variants: Vec<Variant>,
}

impl Item {
  /// The first `limit` variants, in listed order.
  pub fn wanted_variants(&self, limit: usize) -> &[Variant] {
    &self.variants[..limit.min(self.variants.len())]
  }

  /// Local file name for the artifact of variant `index` (zero-based).
  pub fn artifact_name(&self, index: usize, format: &str) -> String {
    format!(
      "{}_{}_{}.{}",
      sanitize(&self.title),
      sanitize(&self.id),
      index + 1,
      format.trim_start_matches('.')
    )
  }
}

const MAX_NAME_LEN: usize = 64;

/// Reduce a display string to something safe to use as a file name component.
fn sanitize(raw: &str) -> String {
  let cleaned: String = raw
    .trim()
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
        c
      } else {
        '_'
      }
    })
    .take(MAX_NAME_LEN)
    .collect();

  let cleaned = cleaned.trim_matches('_');
  if cleaned.is_empty() {
    "untitled".to_string()
  } else {
    cleaned.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item_with(n: usize) -> Item {
    Item {
      id: "a1".to_string(),
      title: "Chair".to_string(),
      variants: vec![Variant::default(); n],
    }
  }

  #[test]
  fn test_wanted_variants_caps_at_limit() {
    assert_eq!(item_with(6).wanted_variants(4).len(), 4);
    assert_eq!(item_with(2).wanted_variants(4).len(), 2);
    assert!(item_with(0).wanted_variants(4).is_empty());
  }

  #[test]
  fn test_artifact_name_is_filesystem_safe() {
    let item = Item {
      id: "abc/123".to_string(),
      title: "  Red chair: v2 ".to_string(),
      variants: Vec::new(),
    };
    assert_eq!(item.artifact_name(0, "glb"), "Red_chair__v2_abc_123_1.glb");
    assert_eq!(item.artifact_name(3, ".usdz"), "Red_chair__v2_abc_123_4.usdz");
  }

  #[test]
  fn test_artifact_name_falls_back_for_empty_title() {
    let item = Item {
      id: "x".to_string(),
      title: "???".to_string(),
      variants: Vec::new(),
    };
    assert_eq!(item.artifact_name(1, "obj"), "untitled_x_2.obj");
  }

  #[test]
  fn test_variant_readiness() {
    let mut variant = Variant::default();
    assert!(!variant.is_ready());
    variant.status = VariantStatus::Success;
    variant
      .urls_by_format
      .insert("glb".to_string(), "https://cdn/x.glb".to_string());
    assert!(variant.is_ready());
    assert_eq!(variant.url_for("glb"), Some("https://cdn/x.glb"));
    assert_eq!(variant.url_for("obj"), None);
  }
}
