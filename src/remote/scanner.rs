//! Fallback extractor for listing bodies that are too large or too broken to
//! deserialize.
//!
//! The scanner only pulls out the fields the engine needs: item ids, titles,
//! variant statuses and per-format URLs. It relies on the key order the
//! listing endpoint emits (`id`, then `title`, then variants) and attributes
//! fields by position:
//! - an `id` followed by a title opens a new item when it sits at the
//!   object depth of the first item; any other `id` belongs to a nested
//!   object of the current item, even when that object has a `name`
//! - every `status` inside an item opens a variant, which claims the format
//!   URLs up to the next `status`

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::api_types::parse_status;
use crate::item::{Item, Variant};

static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#""(?:id|assetId|asset_id)"\s*:\s*(?:"((?:[^"\\]|\\.)+)"|(\d+))"#).unwrap()
});

static TITLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#""(?:title|name|prompt)"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap()
});

static STATUS_REGEX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#""status"\s*:\s*"([A-Za-z_\-]+)""#).unwrap());

static FORMAT_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"(?i)"(glb|gltf|obj|usdz|fbx|stl)"\s*:\s*"(https?:(?:[^"\\]|\\.)+)""#).unwrap()
});

/// Extract items from a listing body without full deserialization.
///
/// Items whose object was cut off before its title are skipped; duplicates
/// keep their first occurrence.
pub fn scan_items(body: &str) -> Vec<Item> {
  let ids: Vec<(usize, String)> = ID_REGEX
    .captures_iter(body)
    .filter_map(|caps| {
      let start = caps.get(0)?.start();
      let id = caps
        .get(1)
        .map(|m| unescape(m.as_str()))
        .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))?;
      Some((start, id))
    })
    .collect();

  let depths = object_depths(body, ids.iter().map(|(start, _)| *start));
  let mut item_depth: Option<usize> = None;

  let mut items: Vec<Item> = Vec::new();
  for (i, (start, id)) in ids.iter().enumerate() {
    let end = ids.get(i + 1).map(|(next, _)| *next).unwrap_or(body.len());
    let segment = &body[*start..end];

    let title = TITLE_REGEX.captures(segment).and_then(|c| c.get(1));
    let opens_item = title.is_some()
      && match item_depth {
        Some(depth) => depths[i] <= depth,
        None => {
          item_depth = Some(depths[i]);
          true
        }
      };

    match title.filter(|_| opens_item) {
      Some(title) => items.push(Item {
        id: id.clone(),
        title: unescape(title.as_str()),
        variants: scan_variants(segment),
      }),
      None => {
        if let Some(current) = items.last_mut() {
          current.variants.extend(scan_variants(segment));
        }
      }
    }
  }

  let mut seen = HashSet::new();
  items.retain(|item| seen.insert(item.id.clone()));
  items
}

fn scan_variants(segment: &str) -> Vec<Variant> {
  let statuses: Vec<(usize, &str)> = STATUS_REGEX
    .captures_iter(segment)
    .filter_map(|caps| Some((caps.get(0)?.start(), caps.get(1)?.as_str())))
    .collect();

  let mut variants = Vec::with_capacity(statuses.len());
  for (i, (start, status)) in statuses.iter().enumerate() {
    // URLs before the first status still belong to the first variant
    let from = if i == 0 { 0 } else { *start };
    let to = statuses
      .get(i + 1)
      .map(|(next, _)| *next)
      .unwrap_or(segment.len());

    let mut variant = Variant {
      status: parse_status(status),
      ..Variant::default()
    };
    for caps in FORMAT_URL_REGEX.captures_iter(&segment[from..to]) {
      let format = caps[1].to_ascii_lowercase();
      variant
        .urls_by_format
        .entry(format)
        .or_insert_with(|| unescape(&caps[2]));
    }
    variants.push(variant);
  }

  variants
}

/// Object nesting depth at each of the ascending byte `positions`.
fn object_depths(body: &str, positions: impl Iterator<Item = usize>) -> Vec<usize> {
  let bytes = body.as_bytes();
  let mut depths = Vec::new();
  let (mut depth, mut cursor) = (0usize, 0usize);
  let (mut in_string, mut escaped) = (false, false);

  for position in positions {
    while cursor < position.min(bytes.len()) {
      let b = bytes[cursor];
      if in_string {
        match b {
          _ if escaped => escaped = false,
          b'\\' => escaped = true,
          b'"' => in_string = false,
          _ => {}
        }
      } else {
        match b {
          b'"' => in_string = true,
          b'{' => depth += 1,
          b'}' => depth = depth.saturating_sub(1),
          _ => {}
        }
      }
      cursor += 1;
    }
    depths.push(depth);
  }
  depths
}

/// Decode JSON string escapes (`\/`, `&`, ...); falls back to the raw text.
fn unescape(raw: &str) -> String {
  serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.to_string())
}
