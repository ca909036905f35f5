//! Capability traits for the collaborators the orchestrator drives.
//!
//! The engine never talks to a browser or the remote service directly; it only
//! sees these traits. Selector strings are configuration and are passed through
//! verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cache::AssetKind;
use crate::item::{Item, ItemId};

/// Errors surfaced by a browser driver
#[derive(Debug, Error)]
pub enum DriverError {
  #[error("no element matches selector `{0}`")]
  ElementNotFound(String),
  #[error("timed out after {0:?}")]
  Timeout(Duration),
  #[error("{0} is not supported by this driver")]
  Unsupported(&'static str),
  #[error("unexpected event: {0}")]
  UnexpectedEvent(String),
  #[error("driver transport error: {0}")]
  Transport(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors surfaced by the remote API
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("HTTP {status} for {url}")]
  Status { status: u16, url: String },
  #[error("could not decode response: {0}")]
  Decode(String),
  #[error("remote rejected request: {0}")]
  Rejected(String),
  #[error("timed out after {0:?}")]
  Timeout(Duration),
}

/// When `navigate` is considered finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitCondition {
  DomContentLoaded,
  #[default]
  Load,
  NetworkIdle,
}

/// Driver-specific reference to a located element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  Download,
  Response,
}

/// Something the page produced that the orchestrator waited for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// A finished download. `handle` is opaque to the engine and only
  /// meaningful to the driver's `save_download`.
  Download {
    suggested_name: String,
    handle: String,
  },
  Response {
    url: String,
    status: u16,
  },
}

/// Kind of resource a page is about to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
  Document,
  Script,
  Stylesheet,
  Image,
  Media,
  Font,
  Xhr,
  Fetch,
  Other,
}

impl ResourceKind {
  /// Content Cache kind, for resources the Content Cache can hold.
  pub fn asset_kind(self) -> Option<AssetKind> {
    match self {
      ResourceKind::Script => Some(AssetKind::Script),
      ResourceKind::Stylesheet => Some(AssetKind::Stylesheet),
      _ => None,
    }
  }

  /// Cosmetic for this workflow; safe to drop.
  pub fn is_cosmetic(self) -> bool {
    matches!(
      self,
      ResourceKind::Image | ResourceKind::Media | ResourceKind::Font
    )
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
  pub url: String,
  pub kind: ResourceKind,
}

impl ResourceRequest {
  pub fn new(url: impl Into<String>, kind: ResourceKind) -> Self {
    Self {
      url: url.into(),
      kind,
    }
  }
}

/// What to do with an intercepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
  Allow,
  Block,
  /// Answer the request locally with a cached body
  Fulfill {
    body: String,
    content_type: &'static str,
  },
}

/// Hook a driver calls for every outgoing resource request.
pub trait RequestInterceptor: Send + Sync {
  fn decide(&self, request: &ResourceRequest) -> Decision;

  /// Called with the response of a request that was allowed through.
  fn on_response(&self, request: &ResourceRequest, status: u16, body: &str);
}

/// Browser automation capabilities.
///
/// Every call is expected to return within a bounded time; the orchestrator
/// additionally wraps each call in its own timeout.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
  async fn navigate(&self, url: &str, wait: WaitCondition) -> Result<(), DriverError>;

  async fn locate_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError>;

  async fn click(&self, element: &ElementHandle) -> Result<(), DriverError>;

  async fn wait_for_event(&self, kind: EventKind, timeout: Duration)
    -> Result<Event, DriverError>;

  async fn intercept_requests(
    &self,
    interceptor: Arc<dyn RequestInterceptor>,
  ) -> Result<(), DriverError>;

  /// Move a finished download to `dest` and return its size in bytes.
  async fn save_download(&self, event: &Event, dest: &Path) -> Result<u64, DriverError>;
}

/// Remote listing and deletion of items. Implementations hand back decoded
/// records; wire formats stay behind this trait.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  async fn list_items(&self) -> Result<Vec<Item>, ApiError>;

  /// List items, bypassing any cached listing.
  async fn refresh_items(&self) -> Result<Vec<Item>, ApiError> {
    self.list_items().await
  }

  async fn delete_items(&self, ids: &[ItemId]) -> Result<(), ApiError>;
}
