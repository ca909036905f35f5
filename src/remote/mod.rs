//! HTTP implementation of the remote asset API.

pub mod api_types;
mod client;
mod scanner;

pub use client::HttpApi;
pub use scanner::scan_items;

use tracing::{debug, warn};

use crate::driver::ApiError;
use crate::item::Item;
use api_types::ApiListResponse;

/// Which parser produced a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
  Structured,
  Scanned,
}

/// Decode a listing body: full deserialization first, the field scanner when
/// the body is larger than `max_structured_bytes` or fails to deserialize.
pub fn decode_items(body: &str, max_structured_bytes: usize) -> Result<(Vec<Item>, ParseTier), ApiError> {
  let structured_error = if body.len() <= max_structured_bytes {
    match serde_json::from_str::<ApiListResponse>(body) {
      Ok(response) => return Ok((response.into_items(), ParseTier::Structured)),
      Err(e) => {
        warn!(error = %e, "listing did not deserialize, falling back to scanner");
        Some(e)
      }
    }
  } else {
    debug!(bytes = body.len(), "listing too large to deserialize, scanning");
    None
  };

  let items = scan_items(body);
  if items.is_empty() && !is_empty_listing(body) {
    let reason = match structured_error {
      Some(e) => format!("no items found after structured decode failed: {e}"),
      None => format!("no items found in {} byte listing", body.len()),
    };
    return Err(ApiError::Decode(reason));
  }

  Ok((items, ParseTier::Scanned))
}

/// A body the scanner legitimately finds nothing in.
fn is_empty_listing(body: &str) -> bool {
  let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
  compact == "[]" || compact.ends_with(":[]}")
}

#[cfg(test)]
mod tests {
  use super::*;

  const LISTING: &str = r#"{"items":[{"id":"a1","title":"Chair","variants":[{"status":"success","urls":{"glb":"https://cdn/a.glb"}}]}]}"#;

  #[test]
  fn test_small_valid_body_is_structured() {
    let (items, tier) = decode_items(LISTING, 1024).unwrap();
    assert_eq!(tier, ParseTier::Structured);
    assert_eq!(items[0].id, "a1");
  }

  #[test]
  fn test_oversized_body_is_scanned() {
    let (items, tier) = decode_items(LISTING, 16).unwrap();
    assert_eq!(tier, ParseTier::Scanned);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].variants[0].url_for("glb"), Some("https://cdn/a.glb"));
  }

  #[test]
  fn test_malformed_body_is_scanned() {
    let broken = &LISTING[..LISTING.len() - 3];
    let (items, tier) = decode_items(broken, 1024).unwrap();
    assert_eq!(tier, ParseTier::Scanned);
    assert_eq!(items[0].title, "Chair");
  }

  #[test]
  fn test_garbage_is_a_decode_error() {
    let err = decode_items("<html>502 Bad Gateway</html>", 1024).unwrap_err();
    assert!(matches!(err, ApiError::Decode(_)));
  }

  #[test]
  fn test_empty_listing_is_not_an_error() {
    let (items, tier) = decode_items(r#"{"items": []}"#, 1024).unwrap();
    assert!(items.is_empty());
    assert_eq!(tier, ParseTier::Structured);

    let (items, _) = decode_items(r#"{ "items" : [ ] }"#, 4).unwrap();
    assert!(items.is_empty());
  }
}
