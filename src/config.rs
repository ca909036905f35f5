use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gatekeeper::{CriticalAllowlist, GatekeeperRule, Preset};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub webdriver: WebDriverConfig,
  #[serde(default)]
  pub paths: PathsConfig,
  #[serde(default)]
  pub batch: BatchConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub gatekeeper: GatekeeperConfig,
  #[serde(default)]
  pub selectors: SelectorsConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Optional external converter run on each verified artifact
  #[serde(default)]
  pub convert: Option<ConvertConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// API base URL, e.g. https://app.example.com
  pub base_url: String,
  #[serde(default = "default_list_path")]
  pub list_path: String,
  #[serde(default = "default_delete_path")]
  pub delete_path: String,
  /// Page listing the items in the web application
  pub app_url: Option<String>,
  /// Per-item page; `{id}` is replaced with the item id. Falls back to `app_url`.
  pub item_url_template: Option<String>,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  /// Listings above this size skip full deserialization and go to the scanner
  #[serde(default = "default_max_structured_bytes")]
  pub max_structured_bytes: usize,
}

fn default_list_path() -> String {
  "/api/assets".to_string()
}

fn default_delete_path() -> String {
  "/api/assets/delete".to_string()
}

fn default_request_timeout_secs() -> u64 {
  30
}

fn default_max_structured_bytes() -> usize {
  8 * 1024 * 1024
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: String::new(),
      list_path: default_list_path(),
      delete_path: default_delete_path(),
      app_url: None,
      item_url_template: None,
      request_timeout_secs: default_request_timeout_secs(),
      max_structured_bytes: default_max_structured_bytes(),
    }
  }
}

impl RemoteConfig {
  /// Page opened before processing an item, with `{id}` still in place.
  pub fn item_page(&self) -> Option<&str> {
    self
      .item_url_template
      .as_deref()
      .or(self.app_url.as_deref())
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebDriverConfig {
  #[serde(default = "default_server_url")]
  pub server_url: String,
  #[serde(default = "default_true")]
  pub headless: bool,
  #[serde(default = "default_command_timeout_secs")]
  pub command_timeout_secs: u64,
  #[serde(default = "default_command_timeout_secs")]
  pub page_load_timeout_secs: u64,
}

fn default_server_url() -> String {
  "http://localhost:9515".to_string()
}

fn default_command_timeout_secs() -> u64 {
  60
}

impl Default for WebDriverConfig {
  fn default() -> Self {
    Self {
      server_url: default_server_url(),
      headless: true,
      command_timeout_secs: default_command_timeout_secs(),
      page_load_timeout_secs: default_command_timeout_secs(),
    }
  }
}

/// Job directory layout. Everything defaults to a location under `job_dir`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
  pub job_dir: Option<PathBuf>,
  pub cache_dir: Option<PathBuf>,
  pub progress_file: Option<PathBuf>,
  pub output_dir: Option<PathBuf>,
  pub download_dir: Option<PathBuf>,
  pub log_dir: Option<PathBuf>,
}

impl PathsConfig {
  pub fn job_dir(&self) -> PathBuf {
    self.job_dir.clone().unwrap_or_else(|| {
      dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("harvester")
    })
  }

  pub fn cache_dir(&self) -> PathBuf {
    self.or_job(&self.cache_dir, "cache")
  }

  pub fn progress_file(&self) -> PathBuf {
    self.or_job(&self.progress_file, "progress.json")
  }

  /// Fingerprints of verified artifacts, next to the progress file
  pub fn ledger_file(&self) -> PathBuf {
    self.progress_file().with_file_name("fingerprints.json")
  }

  pub fn output_dir(&self) -> PathBuf {
    self.or_job(&self.output_dir, "downloads")
  }

  /// Where the browser drops files before they are moved into `output_dir`
  pub fn download_dir(&self) -> PathBuf {
    self.or_job(&self.download_dir, "browser-downloads")
  }

  pub fn log_dir(&self) -> PathBuf {
    self.or_job(&self.log_dir, "logs")
  }

  fn or_job(&self, value: &Option<PathBuf>, name: &str) -> PathBuf {
    value.clone().unwrap_or_else(|| self.job_dir().join(name))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
  /// How many variants of each item to download, in listed order
  #[serde(default = "default_variants_per_item")]
  pub variants_per_item: usize,
  /// Artifacts smaller than this are treated as failed downloads
  #[serde(default = "default_min_file_size_bytes")]
  pub min_file_size_bytes: u64,
  /// Items processed before discovery is queried again
  #[serde(default = "default_items_per_batch")]
  pub items_per_batch: usize,
  #[serde(default = "default_format")]
  pub format: String,
  #[serde(default = "default_step_timeout_secs")]
  pub step_timeout_secs: u64,
  #[serde(default = "default_download_timeout_secs")]
  pub download_timeout_secs: u64,
  /// Attempts per item within one run before it is left for the next run
  #[serde(default = "default_max_attempts_per_item")]
  pub max_attempts_per_item: u32,
}

fn default_variants_per_item() -> usize {
  4
}

fn default_min_file_size_bytes() -> u64 {
  1024 * 1024
}

fn default_items_per_batch() -> usize {
  4
}

fn default_format() -> String {
  "glb".to_string()
}

fn default_step_timeout_secs() -> u64 {
  30
}

fn default_download_timeout_secs() -> u64 {
  300
}

fn default_max_attempts_per_item() -> u32 {
  2
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self {
      variants_per_item: default_variants_per_item(),
      min_file_size_bytes: default_min_file_size_bytes(),
      items_per_batch: default_items_per_batch(),
      format: default_format(),
      step_timeout_secs: default_step_timeout_secs(),
      download_timeout_secs: default_download_timeout_secs(),
      max_attempts_per_item: default_max_attempts_per_item(),
    }
  }
}

impl BatchConfig {
  pub fn step_timeout(&self) -> Duration {
    Duration::from_secs(self.step_timeout_secs)
  }

  pub fn download_timeout(&self) -> Duration {
    Duration::from_secs(self.download_timeout_secs)
  }
}

/// External command turning a downloaded artifact into the output format,
/// e.g. a headless Blender script exporting `.usdz` as compressed `.glb`.
///
/// `{input}` and `{output}` in `args` are replaced with the artifact path and
/// the path the converted file must be written to.
#[derive(Debug, Clone, Deserialize)]
pub struct ConvertConfig {
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default = "default_convert_output_format")]
  pub output_format: String,
  #[serde(default = "default_convert_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_convert_output_format() -> String {
  "glb".to_string()
}

fn default_convert_timeout_secs() -> u64 {
  600
}

impl ConvertConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

/// Backoff for discovery failures
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_discovery_attempts")]
  pub discovery_attempts: u32,
  #[serde(default = "default_base_delay_ms")]
  pub base_delay_ms: u64,
  #[serde(default = "default_max_delay_ms")]
  pub max_delay_ms: u64,
}

fn default_discovery_attempts() -> u32 {
  5
}

fn default_base_delay_ms() -> u64 {
  1000
}

fn default_max_delay_ms() -> u64 {
  30_000
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      discovery_attempts: default_discovery_attempts(),
      base_delay_ms: default_base_delay_ms(),
      max_delay_ms: default_max_delay_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatekeeperConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default)]
  pub preset: Preset,
  /// Evaluated before the preset's rules
  #[serde(default)]
  pub rules: Vec<GatekeeperRule>,
  /// URL globs that are never blocked
  #[serde(default)]
  pub critical: Vec<String>,
  /// Hosts whose scripts and stylesheets are never blocked. The host of
  /// `remote.app_url` is always included.
  #[serde(default)]
  pub first_party_hosts: Vec<String>,
}

impl Default for GatekeeperConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      preset: Preset::default(),
      rules: Vec::new(),
      critical: Vec::new(),
      first_party_hosts: Vec::new(),
    }
  }
}

/// CSS selectors for the web application's controls
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorsConfig {
  /// One element per variant, in listed order; clicking opens the viewer
  #[serde(default = "default_variant_selector")]
  pub variant: String,
  /// `{format}` is replaced with the configured format
  #[serde(default = "default_format_option_selector")]
  pub format_option: String,
  #[serde(default = "default_download_button_selector")]
  pub download_button: String,
  /// Clicked after each variant when set
  pub close_viewer: Option<String>,
}

fn default_variant_selector() -> String {
  "[data-testid='variant-thumbnail']".to_string()
}

fn default_format_option_selector() -> String {
  "[data-format='{format}']".to_string()
}

fn default_download_button_selector() -> String {
  "[data-testid='download-button']".to_string()
}

impl Default for SelectorsConfig {
  fn default() -> Self {
    Self {
      variant: default_variant_selector(),
      format_option: default_format_option_selector(),
      download_button: default_download_button_selector(),
      close_viewer: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// How long a cached listing is served before discovery hits the API again
  #[serde(default = "default_list_ttl_minutes")]
  pub list_ttl_minutes: i64,
}

fn default_list_ttl_minutes() -> i64 {
  5
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      list_ttl_minutes: default_list_ttl_minutes(),
    }
  }
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./harvester.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/harvester/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create ./harvester.yaml or ~/.config/harvester/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("harvester.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("harvester").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.remote.base_url.trim().is_empty() {
      return Err(eyre!("remote.base_url must be set"));
    }
    if self.batch.variants_per_item == 0 {
      return Err(eyre!("batch.variants_per_item must be at least 1"));
    }
    if self.batch.items_per_batch == 0 {
      return Err(eyre!("batch.items_per_batch must be at least 1"));
    }
    if self.batch.max_attempts_per_item == 0 {
      return Err(eyre!("batch.max_attempts_per_item must be at least 1"));
    }
    if let Some(convert) = &self.convert {
      if convert.command.trim().is_empty() {
        return Err(eyre!("convert.command must be set when convert is configured"));
      }
      if convert.timeout_secs == 0 {
        return Err(eyre!("convert.timeout_secs must be at least 1"));
      }
    }
    Ok(())
  }

  /// Get the API token from environment variables.
  ///
  /// Checks HARVESTER_API_TOKEN first, then API_TOKEN as fallback. The API
  /// may not require one, so a missing token is not an error.
  pub fn api_token() -> Option<String> {
    std::env::var("HARVESTER_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// First-party hosts for the critical allowlist.
  ///
  /// The hosts of every configured remote URL are always included, so the
  /// app's own bundles stay critical under any preset.
  pub fn first_party_hosts(&self) -> Vec<String> {
    let mut hosts = self.gatekeeper.first_party_hosts.clone();
    let remote_urls = [
      Some(self.remote.base_url.as_str()),
      self.remote.app_url.as_deref(),
      self.remote.item_url_template.as_deref(),
    ];
    for raw in remote_urls.into_iter().flatten() {
      let host = url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase));
      if let Some(host) = host {
        if !hosts.contains(&host) {
          hosts.push(host);
        }
      }
    }
    hosts
  }

  /// Critical allowlist from the configured globs and first-party hosts.
  pub fn critical_allowlist(&self) -> CriticalAllowlist {
    CriticalAllowlist::new(&self.gatekeeper.critical, &self.first_party_hosts())
  }
}
