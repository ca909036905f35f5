//! Serde-deserializable types matching the asset listing endpoint.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::item::{Item, Variant, VariantStatus};

// ============================================================================
// Listing response
// ============================================================================

/// The listing endpoint answers either with a wrapped list or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiListResponse {
  Wrapped {
    #[serde(alias = "assets", alias = "data", alias = "results")]
    items: Vec<ApiItem>,
  },
  Bare(Vec<ApiItem>),
}

impl ApiListResponse {
  pub fn into_items(self) -> Vec<Item> {
    let raw = match self {
      ApiListResponse::Wrapped { items } => items,
      ApiListResponse::Bare(items) => items,
    };
    raw.into_iter().map(ApiItem::into_item).collect()
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiItem {
  #[serde(alias = "assetId", alias = "asset_id")]
  pub id: ApiId,
  #[serde(default, alias = "name", alias = "prompt")]
  pub title: String,
  #[serde(default, alias = "models", alias = "outputs")]
  pub variants: Vec<ApiVariant>,
}

impl ApiItem {
  pub fn into_item(self) -> Item {
    Item {
      id: self.id.into_string(),
      title: self.title,
      variants: self.variants.into_iter().map(ApiVariant::into_variant).collect(),
    }
  }
}

/// Ids arrive as strings or numbers depending on the endpoint version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiId {
  Text(String),
  Number(u64),
}

impl ApiId {
  fn into_string(self) -> String {
    match self {
      ApiId::Text(s) => s,
      ApiId::Number(n) => n.to_string(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiVariant {
  #[serde(default)]
  pub status: String,
  #[serde(default, alias = "urls_by_format", alias = "files", alias = "downloads")]
  pub urls: BTreeMap<String, String>,
}

impl ApiVariant {
  pub fn into_variant(self) -> Variant {
    Variant {
      status: parse_status(&self.status),
      urls_by_format: self
        .urls
        .into_iter()
        .map(|(format, url)| (format.to_ascii_lowercase(), url))
        .collect(),
    }
  }
}

/// Map the remote's status vocabulary onto ours; unknown means not ready yet.
pub fn parse_status(raw: &str) -> VariantStatus {
  match raw.trim().to_ascii_lowercase().as_str() {
    "success" | "succeeded" | "completed" | "complete" | "done" | "ready" => {
      VariantStatus::Success
    }
    "failed" | "failure" | "error" | "errored" | "cancelled" => VariantStatus::Failed,
    _ => VariantStatus::Pending,
  }
}

// ============================================================================
// Deletion response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiDeleteResponse {
  #[serde(default = "default_true")]
  pub success: bool,
  #[serde(default)]
  pub message: Option<String>,
}

fn default_true() -> bool {
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_wrapped_listing() {
    let body = r#"{
      "items": [
        {
          "id": "a1",
          "title": "Chair",
          "variants": [
            { "status": "success", "urls": { "GLB": "https://cdn/a1-1.glb", "obj": "https://cdn/a1-1.obj" } },
            { "status": "in_progress" }
          ]
        }
      ]
    }"#;

    let items = serde_json::from_str::<ApiListResponse>(body)
      .unwrap()
      .into_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "a1");
    assert_eq!(items[0].variants[0].status, VariantStatus::Success);
    assert_eq!(items[0].variants[0].url_for("glb"), Some("https://cdn/a1-1.glb"));
    assert_eq!(items[0].variants[1].status, VariantStatus::Pending);
  }

  #[test]
  fn test_bare_listing_with_aliases() {
    let body = r#"[{ "assetId": 17, "name": "Lamp", "models": [{ "status": "failed" }] }]"#;

    let items = serde_json::from_str::<ApiListResponse>(body)
      .unwrap()
      .into_items();
    assert_eq!(items[0].id, "17");
    assert_eq!(items[0].title, "Lamp");
    assert_eq!(items[0].variants[0].status, VariantStatus::Failed);
  }

  #[test]
  fn test_delete_response_defaults_to_success() {
    let ok: ApiDeleteResponse = serde_json::from_str("{}").unwrap();
    assert!(ok.success);

    let rejected: ApiDeleteResponse =
      serde_json::from_str(r#"{ "success": false, "message": "locked" }"#).unwrap();
    assert!(!rejected.success);
    assert_eq!(rejected.message.as_deref(), Some("locked"));
  }
}
