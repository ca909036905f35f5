use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::api_types::ApiDeleteResponse;
use super::{decode_items, ParseTier};
use crate::cache::{CacheLayer, CacheSource, CacheStorage};
use crate::config::RemoteConfig;
use crate::driver::{ApiError, RemoteApi};
use crate::item::{Item, ItemId};

const LIST_CACHE_KEY: &str = "remote:items";

/// Remote asset API over HTTP, with listing responses cached through a
/// [`CacheLayer`].
pub struct HttpApi<S: CacheStorage> {
  client: Client,
  list_url: Url,
  delete_url: Url,
  token: Option<String>,
  max_structured_bytes: usize,
  cache: CacheLayer<S>,
}

impl<S: CacheStorage> HttpApi<S> {
  pub fn new(config: &RemoteConfig, token: Option<String>, cache: CacheLayer<S>) -> Result<Self> {
    let base = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid remote.base_url {}: {}", config.base_url, e))?;
    let list_url = base
      .join(&config.list_path)
      .map_err(|e| eyre!("Invalid remote.list_path {}: {}", config.list_path, e))?;
    let delete_url = base
      .join(&config.delete_path)
      .map_err(|e| eyre!("Invalid remote.delete_path {}: {}", config.delete_path, e))?;

    let client = Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      list_url,
      delete_url,
      token,
      max_structured_bytes: config.max_structured_bytes,
      cache,
    })
  }

  async fn fetch_items(&self) -> Result<Vec<Item>, ApiError> {
    let response = self
      .authorized(self.client.get(self.list_url.clone()))
      .send()
      .await?;
    check_status(response.status(), &self.list_url)?;

    let body = response.text().await?;
    let (items, tier) = decode_items(&body, self.max_structured_bytes)?;
    if tier == ParseTier::Scanned {
      info!(bytes = body.len(), items = items.len(), "listing decoded by scanner");
    }
    Ok(items)
  }

  fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }
}

fn check_status(status: StatusCode, url: &Url) -> Result<(), ApiError> {
  if status.is_success() {
    Ok(())
  } else {
    Err(ApiError::Status {
      status: status.as_u16(),
      url: url.to_string(),
    })
  }
}

#[async_trait]
impl<S: CacheStorage + 'static> RemoteApi for HttpApi<S> {
  async fn list_items(&self) -> Result<Vec<Item>, ApiError> {
    let result = self
      .cache
      .fetch(LIST_CACHE_KEY, || self.fetch_items())
      .await?;

    if result.source == CacheSource::Cache {
      debug!(items = result.data.len(), "listing served from cache");
    }
    Ok(result.data)
  }

  async fn refresh_items(&self) -> Result<Vec<Item>, ApiError> {
    self.cache.invalidate(LIST_CACHE_KEY);
    self.list_items().await
  }

  async fn delete_items(&self, ids: &[ItemId]) -> Result<(), ApiError> {
    if ids.is_empty() {
      return Ok(());
    }

    let response = self
      .authorized(self.client.post(self.delete_url.clone()))
      .json(&json!({ "ids": ids }))
      .send()
      .await?;
    check_status(response.status(), &self.delete_url)?;

    // Indices shift after a deletion; the next discovery must see fresh data
    self.cache.invalidate(LIST_CACHE_KEY);

    let body = response.text().await?;
    if body.trim().is_empty() {
      return Ok(());
    }
    match serde_json::from_str::<ApiDeleteResponse>(&body) {
      Ok(ApiDeleteResponse { success: false, message }) => Err(ApiError::Rejected(
        message.unwrap_or_else(|| "deletion refused".to_string()),
      )),
      Ok(_) => Ok(()),
      Err(e) => {
        debug!(error = %e, "unrecognised deletion response body, trusting status");
        Ok(())
      }
    }
  }
}
