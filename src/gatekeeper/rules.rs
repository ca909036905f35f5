//! Rule configuration for the gatekeeper.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::driver::{ResourceKind, ResourceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
  Block,
  Allow,
  ServeCached,
}

/// What a rule matches on.
///
/// In YAML: `{ glob: "*sentry.io*" }` or `{ kind: stylesheet }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pattern {
  /// Shell-style glob over the full URL (`*` any run, `?` one char), case-insensitive
  Glob { glob: String },
  Kind { kind: ResourceKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatekeeperRule {
  pub pattern: Pattern,
  pub action: RuleAction,
}

impl GatekeeperRule {
  pub fn block_glob(glob: &str) -> Self {
    Self {
      pattern: Pattern::Glob {
        glob: glob.to_string(),
      },
      action: RuleAction::Block,
    }
  }

  pub fn block_kind(kind: ResourceKind) -> Self {
    Self {
      pattern: Pattern::Kind { kind },
      action: RuleAction::Block,
    }
  }
}

/// Blocking strength; each preset is a rule list, not a code path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
  /// Telemetry and analytics only
  #[default]
  Minimal,
  /// Also fonts, non-essential API calls and third-party stylesheets
  Aggressive,
}

const TELEMETRY: &[&str] = &[
  "*google-analytics.com*",
  "*googletagmanager.com*",
  "*doubleclick.net*",
  "*sentry.io*",
  "*segment.io*",
  "*segment.com/v1*",
  "*hotjar.com*",
  "*mixpanel.com*",
  "*amplitude.com*",
  "*intercom.io*",
  "*/telemetry*",
  "*/collect?*",
];

const NON_ESSENTIAL: &[&str] = &[
  "*.woff",
  "*.woff2",
  "*.ttf",
  "*.gif",
  "*.svg",
  "*/api/*/recommendations*",
  "*/api/*/notifications*",
  "*/api/*/analytics*",
  "*/api/*/feedback*",
];

impl Preset {
  pub fn rules(self) -> Vec<GatekeeperRule> {
    let mut rules: Vec<GatekeeperRule> = TELEMETRY
      .iter()
      .map(|g| GatekeeperRule::block_glob(g))
      .collect();

    if self == Preset::Aggressive {
      rules.extend(NON_ESSENTIAL.iter().map(|g| GatekeeperRule::block_glob(g)));
      // Critical stylesheets are exempt through the allowlist
      rules.push(GatekeeperRule::block_kind(ResourceKind::Stylesheet));
    }

    rules
  }
}

/// A pattern ready for matching.
#[derive(Debug, Clone)]
pub(crate) enum Matcher {
  Url(Regex),
  Kind(ResourceKind),
}

impl Matcher {
  pub(crate) fn compile(pattern: &Pattern) -> Self {
    match pattern {
      Pattern::Glob { glob } => Matcher::Url(glob_to_regex(glob)),
      Pattern::Kind { kind } => Matcher::Kind(*kind),
    }
  }

  pub(crate) fn matches(&self, request: &ResourceRequest) -> bool {
    match self {
      Matcher::Url(re) => re.is_match(&request.url),
      Matcher::Kind(kind) => *kind == request.kind,
    }
  }
}

/// Translate a glob into an anchored, case-insensitive regex.
pub(crate) fn glob_to_regex(glob: &str) -> Regex {
  let mut source = String::with_capacity(glob.len() + 8);
  source.push('^');
  let mut buf = [0u8; 4];
  for c in glob.chars() {
    match c {
      '*' => source.push_str(".*"),
      '?' => source.push('.'),
      _ => source.push_str(&regex::escape(c.encode_utf8(&mut buf))),
    }
  }
  source.push('$');

  // Every literal is escaped, so the pattern is always valid
  RegexBuilder::new(&source)
    .case_insensitive(true)
    .build()
    .unwrap_or_else(|_| Regex::new("$^").unwrap())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn req(url: &str, kind: ResourceKind) -> ResourceRequest {
    ResourceRequest::new(url, kind)
  }

  #[test]
  fn test_glob_matching() {
    let re = glob_to_regex("*sentry.io*");
    assert!(re.is_match("https://o1.ingest.SENTRY.io/api/1/envelope/"));
    assert!(!re.is_match("https://example.com/sentry"));

    let re = glob_to_regex("*.woff?");
    assert!(re.is_match("https://cdn.test/font.woff2"));
    assert!(!re.is_match("https://cdn.test/font.woff"));

    let re = glob_to_regex("https://x.test/a+b(1).js");
    assert!(re.is_match("https://x.test/a+b(1).js"));
  }

  #[test]
  fn test_kind_matcher() {
    let m = Matcher::compile(&Pattern::Kind {
      kind: ResourceKind::Font,
    });
    assert!(m.matches(&req("https://x/f.woff2", ResourceKind::Font)));
    assert!(!m.matches(&req("https://x/f.woff2", ResourceKind::Other)));
  }

  #[test]
  fn test_presets() {
    let minimal = Preset::Minimal.rules();
    let aggressive = Preset::Aggressive.rules();
    assert!(aggressive.len() > minimal.len());
    assert!(!minimal.contains(&GatekeeperRule::block_kind(ResourceKind::Stylesheet)));
    assert!(aggressive.contains(&GatekeeperRule::block_kind(ResourceKind::Stylesheet)));
  }

  #[test]
  fn test_rule_yaml_shape() {
    let rules: Vec<GatekeeperRule> = serde_yaml::from_str(
      r#"
- pattern: { glob: "*/api/*/likes*" }
  action: block
- pattern: { kind: script }
  action: serve-cached
"#,
    )
    .unwrap();

    assert_eq!(rules[0], GatekeeperRule::block_glob("*/api/*/likes*"));
    assert_eq!(
      rules[1].pattern,
      Pattern::Kind {
        kind: ResourceKind::Script
      }
    );
    assert_eq!(rules[1].action, RuleAction::ServeCached);
  }
}
