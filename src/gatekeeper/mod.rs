//! Per-request allow/block/serve-cached decisions for a page session.
//!
//! Decision order for one request:
//! 1. Rules in registration order, first match wins. Block rules never apply
//!    to critical resources.
//! 2. Images, media and fonts are blocked unless critical or explicitly allowed.
//! 3. Scripts and stylesheets are answered from the content cache when fresh;
//!    otherwise they go to the network and a 200 response is cached.
//! 4. Everything else is allowed.
//!
//! Critical resources (the document, the allowlist patterns, and first-party
//! scripts/stylesheets) can never be blocked, whatever the rules say. Blocking
//! the application shell leaves the page unusable.

mod rules;

pub use rules::{GatekeeperRule, Pattern, Preset, RuleAction};

use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};
use url::Url;

use crate::cache::{AssetKind, ContentCache};
use crate::driver::{Decision, RequestInterceptor, ResourceKind, ResourceRequest};
use rules::{glob_to_regex, Matcher};

/// Resources that must always reach the page.
#[derive(Debug, Clone, Default)]
pub struct CriticalAllowlist {
  patterns: Vec<Regex>,
  first_party_hosts: Vec<String>,
}

impl CriticalAllowlist {
  pub fn new(globs: &[String], first_party_hosts: &[String]) -> Self {
    Self {
      patterns: globs.iter().map(|g| glob_to_regex(g)).collect(),
      first_party_hosts: first_party_hosts
        .iter()
        .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect(),
    }
  }

  pub fn is_critical(&self, request: &ResourceRequest) -> bool {
    if request.kind == ResourceKind::Document {
      return true;
    }
    if self.patterns.iter().any(|re| re.is_match(&request.url)) {
      return true;
    }
    request.kind.asset_kind().is_some() && self.is_first_party(&request.url)
  }

  fn is_first_party(&self, url: &str) -> bool {
    let Some(host) = Url::parse(url)
      .ok()
      .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
      return false;
    };

    self
      .first_party_hosts
      .iter()
      .any(|fp| host == *fp || host.ends_with(&format!(".{fp}")))
  }
}

/// Process-lifetime decision counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateCounters {
  pub blocked: u64,
  pub allowed: u64,
  pub cached: u64,
}

/// Rule engine installed on a page session.
pub struct Gatekeeper {
  rules: Vec<(Matcher, RuleAction)>,
  critical: CriticalAllowlist,
  content: Arc<Mutex<ContentCache>>,
  blocked: AtomicU64,
  allowed: AtomicU64,
  cached: AtomicU64,
}

impl Gatekeeper {
  pub fn new(
    rules: &[GatekeeperRule],
    critical: CriticalAllowlist,
    content: Arc<Mutex<ContentCache>>,
  ) -> Self {
    Self {
      rules: rules
        .iter()
        .map(|r| (Matcher::compile(&r.pattern), r.action))
        .collect(),
      critical,
      content,
      blocked: AtomicU64::new(0),
      allowed: AtomicU64::new(0),
      cached: AtomicU64::new(0),
    }
  }

  /// `extra` rules are registered before the preset's, so they take precedence.
  pub fn from_preset(
    preset: Preset,
    extra: &[GatekeeperRule],
    critical: CriticalAllowlist,
    content: Arc<Mutex<ContentCache>>,
  ) -> Self {
    let mut rules = extra.to_vec();
    rules.extend(preset.rules());
    Self::new(&rules, critical, content)
  }

  pub fn decide(&self, request: &ResourceRequest) -> Decision {
    let decision = self.evaluate(request);
    let counter = match &decision {
      Decision::Allow => &self.allowed,
      Decision::Block => &self.blocked,
      Decision::Fulfill { .. } => &self.cached,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    trace!(url = %request.url, kind = ?request.kind, ?decision, "gatekeeper");
    decision
  }

  /// Cache a successful script/stylesheet response.
  pub fn on_response(&self, request: &ResourceRequest, status: u16, body: &str) {
    if status != 200 {
      return;
    }
    let Some(kind) = request.kind.asset_kind() else {
      return;
    };
    if let Ok(mut content) = self.content.lock() {
      if !content.set(&request.url, body, kind) {
        debug!(url = %request.url, "content cache write failed");
      }
    }
  }

  pub fn counters(&self) -> GateCounters {
    GateCounters {
      blocked: self.blocked.load(Ordering::Relaxed),
      allowed: self.allowed.load(Ordering::Relaxed),
      cached: self.cached.load(Ordering::Relaxed),
    }
  }

  pub fn log_counters(&self) {
    let c = self.counters();
    info!(
      blocked = c.blocked,
      allowed = c.allowed,
      cached = c.cached,
      "gatekeeper"
    );
  }

  fn evaluate(&self, request: &ResourceRequest) -> Decision {
    let critical = self.critical.is_critical(request);
    let mut matched = None;

    for (matcher, action) in &self.rules {
      if !matcher.matches(request) {
        continue;
      }
      if *action == RuleAction::Block && critical {
        continue;
      }
      matched = Some(*action);
      break;
    }

    match matched {
      Some(RuleAction::Block) => return Decision::Block,
      // Explicit allow always goes to the network
      Some(RuleAction::Allow) => return Decision::Allow,
      Some(RuleAction::ServeCached) | None => {}
    }

    if matched.is_none() && !critical && request.kind.is_cosmetic() {
      return Decision::Block;
    }

    if let Some(kind) = request.kind.asset_kind() {
      if let Some(body) = self.cached_body(&request.url, kind) {
        return Decision::Fulfill {
          body,
          content_type: kind.content_type(),
        };
      }
    }

    Decision::Allow
  }

  fn cached_body(&self, url: &str, kind: AssetKind) -> Option<String> {
    let mut content = self.content.lock().ok()?;
    content.get(url, kind)
  }
}

impl RequestInterceptor for Gatekeeper {
  fn decide(&self, request: &ResourceRequest) -> Decision {
    Gatekeeper::decide(self, request)
  }

  fn on_response(&self, request: &ResourceRequest, status: u16, body: &str) {
    Gatekeeper::on_response(self, request, status, body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const APP_CSS: &str = "https://app.example.com/static/app.abc12345.css";

  fn content(dir: &TempDir) -> Arc<Mutex<ContentCache>> {
    Arc::new(Mutex::new(ContentCache::load(
      dir.path().join("content-cache.json"),
    )))
  }

  fn req(url: &str, kind: ResourceKind) -> ResourceRequest {
    ResourceRequest::new(url, kind)
  }

  #[test]
  fn test_critical_stylesheet_survives_block_all_stylesheets() {
    let dir = TempDir::new().unwrap();
    let rules = vec![
      GatekeeperRule::block_glob("*.css"),
      GatekeeperRule::block_kind(ResourceKind::Stylesheet),
    ];
    let critical = CriticalAllowlist::new(&["*/static/app.*.css".to_string()], &[]);
    let gate = Gatekeeper::new(&rules, critical, content(&dir));

    assert_eq!(
      gate.decide(&req(APP_CSS, ResourceKind::Stylesheet)),
      Decision::Allow
    );
    assert_eq!(
      gate.decide(&req(
        "https://fonts.cdn.test/theme.css",
        ResourceKind::Stylesheet
      )),
      Decision::Block
    );
  }

  #[test]
  fn test_first_party_bundle_is_never_blocked() {
    let dir = TempDir::new().unwrap();
    let critical = CriticalAllowlist::new(&[], &["example.com".to_string()]);
    let gate = Gatekeeper::new(
      &[GatekeeperRule::block_kind(ResourceKind::Script)],
      critical,
      content(&dir),
    );

    assert_eq!(
      gate.decide(&req(
        "https://app.example.com/assets/main.js",
        ResourceKind::Script
      )),
      Decision::Allow
    );
    assert_eq!(
      gate.decide(&req("https://notexample.com/x.js", ResourceKind::Script)),
      Decision::Block
    );
  }

  #[test]
  fn test_aggressive_preset_keeps_app_stylesheet_from_minimal_config() {
    let dir = TempDir::new().unwrap();
    let config = crate::config::Config::from_yaml(
      "remote:\n  base_url: https://app.example.com\ngatekeeper:\n  preset: aggressive\n",
    )
    .unwrap();
    let gate = Gatekeeper::from_preset(
      config.gatekeeper.preset,
      &config.gatekeeper.rules,
      config.critical_allowlist(),
      content(&dir),
    );

    assert_eq!(
      gate.decide(&req(
        "https://app.example.com/static/main.css",
        ResourceKind::Stylesheet
      )),
      Decision::Allow
    );
    assert_eq!(
      gate.decide(&req(
        "https://fonts.cdn.test/theme.css",
        ResourceKind::Stylesheet
      )),
      Decision::Block
    );
  }

  #[test]
  fn test_document_is_always_allowed() {
    let dir = TempDir::new().unwrap();
    let gate = Gatekeeper::new(
      &[GatekeeperRule::block_glob("*")],
      CriticalAllowlist::default(),
      content(&dir),
    );
    assert_eq!(
      gate.decide(&req("https://app.example.com/", ResourceKind::Document)),
      Decision::Allow
    );
  }

  #[test]
  fn test_cosmetic_kinds_blocked_by_default() {
    let dir = TempDir::new().unwrap();
    let gate = Gatekeeper::new(&[], CriticalAllowlist::default(), content(&dir));

    for kind in [ResourceKind::Image, ResourceKind::Media, ResourceKind::Font] {
      assert_eq!(gate.decide(&req("https://cdn.test/x", kind)), Decision::Block);
    }
    assert_eq!(
      gate.decide(&req("https://api.test/items", ResourceKind::Xhr)),
      Decision::Allow
    );
  }

  #[test]
  fn test_explicit_allow_overrides_cosmetic_block() {
    let dir = TempDir::new().unwrap();
    let rules = vec![GatekeeperRule {
      pattern: Pattern::Glob {
        glob: "*/thumbnails/*".to_string(),
      },
      action: RuleAction::Allow,
    }];
    let gate = Gatekeeper::new(&rules, CriticalAllowlist::default(), content(&dir));

    assert_eq!(
      gate.decide(&req("https://cdn.test/thumbnails/a.png", ResourceKind::Image)),
      Decision::Allow
    );
  }

  #[test]
  fn test_telemetry_blocked_by_preset() {
    let dir = TempDir::new().unwrap();
    let gate = Gatekeeper::from_preset(
      Preset::Minimal,
      &[],
      CriticalAllowlist::default(),
      content(&dir),
    );
    assert_eq!(
      gate.decide(&req(
        "https://www.google-analytics.com/analytics.js",
        ResourceKind::Script
      )),
      Decision::Block
    );
  }

  #[test]
  fn test_successful_response_is_served_from_cache_next_time() {
    let dir = TempDir::new().unwrap();
    let gate = Gatekeeper::new(&[], CriticalAllowlist::default(), content(&dir));
    let request = req("https://app.example.com/static/vendor.js?v=3", ResourceKind::Script);

    assert_eq!(gate.decide(&request), Decision::Allow);
    gate.on_response(&request, 200, "console.log(1)");

    assert_eq!(
      gate.decide(&request),
      Decision::Fulfill {
        body: "console.log(1)".to_string(),
        content_type: "application/javascript",
      }
    );
    assert_eq!(
      gate.counters(),
      GateCounters {
        blocked: 0,
        allowed: 1,
        cached: 1
      }
    );
  }

  #[test]
  fn test_non_200_response_is_not_cached() {
    let dir = TempDir::new().unwrap();
    let gate = Gatekeeper::new(&[], CriticalAllowlist::default(), content(&dir));
    let request = req("https://app.example.com/a.css", ResourceKind::Stylesheet);

    gate.on_response(&request, 404, "not found");
    assert_eq!(gate.decide(&request), Decision::Allow);
  }

  #[test]
  fn test_critical_resource_can_still_be_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let critical = CriticalAllowlist::new(&[], &["example.com".to_string()]);
    let gate = Gatekeeper::new(
      &[GatekeeperRule::block_kind(ResourceKind::Stylesheet)],
      critical,
      content(&dir),
    );
    let request = req(APP_CSS, ResourceKind::Stylesheet);

    gate.on_response(&request, 200, "body{}");
    assert!(matches!(gate.decide(&request), Decision::Fulfill { .. }));
  }
}
