//! Browser driver speaking the W3C WebDriver protocol to a running
//! chromedriver (or compatible) server.
//!
//! Downloads are observed by watching the browser's download directory;
//! request interception is not part of the protocol and is reported as
//! unsupported.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use url::Url;

use crate::config::WebDriverConfig;
use crate::driver::{
  BrowserDriver, DriverError, ElementHandle, Event, EventKind, RequestInterceptor, WaitCondition,
};

/// Key under which WebDriver returns element references
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Browser suffixes for downloads still in flight
const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "part", "tmp", "download"];

/// Quiet period treated as "network idle" once the document is complete
const IDLE_SETTLE: Duration = Duration::from_millis(500);

pub struct WebDriver {
  client: Client,
  session_url: Url,
  download_dir: PathBuf,
  page_load_timeout: Duration,
  poll_interval: Duration,
  /// Download files already reported or present before the session started
  seen: Mutex<HashSet<PathBuf>>,
}

impl WebDriver {
  /// Start a new browser session.
  pub async fn connect(config: &WebDriverConfig, download_dir: &Path) -> Result<Self, DriverError> {
    tokio::fs::create_dir_all(download_dir).await?;
    let download_dir = tokio::fs::canonicalize(download_dir).await?;

    let client = Client::builder()
      .timeout(Duration::from_secs(config.command_timeout_secs))
      .build()
      .map_err(|e| DriverError::Transport(e.to_string()))?;

    let server = Url::parse(&config.server_url)
      .map_err(|e| DriverError::Transport(format!("invalid server url: {e}")))?;

    let mut args = vec!["--no-sandbox".to_string(), "--disable-dev-shm-usage".to_string()];
    if config.headless {
      args.push("--headless=new".to_string());
    }
    let capabilities = json!({
      "capabilities": {
        "alwaysMatch": {
          "browserName": "chrome",
          "pageLoadStrategy": "eager",
          "goog:chromeOptions": {
            "args": args,
            "prefs": {
              "download.default_directory": download_dir.to_string_lossy(),
              "download.prompt_for_download": false,
              "safebrowsing.enabled": true
            }
          }
        }
      }
    });

    let session_endpoint = join(&server, "session")?;
    let value = send(&client, Method::POST, session_endpoint, Some(capabilities)).await?;
    let session_id = value
      .get("sessionId")
      .and_then(Value::as_str)
      .ok_or_else(|| DriverError::Transport("session response without sessionId".to_string()))?;

    let session_url = join(&server, &format!("session/{session_id}/"))?;
    info!(%session_id, dir = %download_dir.display(), "browser session started");

    Ok(Self::with_session(
      client,
      session_url,
      download_dir,
      Duration::from_secs(config.page_load_timeout_secs),
    ))
  }

  fn with_session(
    client: Client,
    session_url: Url,
    download_dir: PathBuf,
    page_load_timeout: Duration,
  ) -> Self {
    let existing = snapshot_downloads(&download_dir).unwrap_or_default();

    Self {
      client,
      session_url,
      download_dir,
      page_load_timeout,
      poll_interval: Duration::from_millis(250),
      seen: Mutex::new(existing),
    }
  }

  /// End the browser session.
  pub async fn close(&self) -> Result<(), DriverError> {
    let url = Url::parse(self.session_url.as_str().trim_end_matches('/'))
      .map_err(|e| DriverError::Transport(e.to_string()))?;
    send(&self.client, Method::DELETE, url, None).await?;
    debug!("browser session closed");
    Ok(())
  }

  async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DriverError> {
    let url = join(&self.session_url, path)?;
    send(&self.client, method, url, body).await
  }

  async fn ready_state(&self) -> Result<String, DriverError> {
    let value = self
      .command(
        Method::POST,
        "execute/sync",
        Some(json!({ "script": "return document.readyState", "args": [] })),
      )
      .await?;
    Ok(value.as_str().unwrap_or_default().to_string())
  }

  async fn wait_for_ready_state(&self, wait: WaitCondition) -> Result<(), DriverError> {
    let deadline = Instant::now() + self.page_load_timeout;
    loop {
      let state = self.ready_state().await?;
      let done = match wait {
        WaitCondition::DomContentLoaded => state == "interactive" || state == "complete",
        WaitCondition::Load | WaitCondition::NetworkIdle => state == "complete",
      };
      if done {
        return Ok(());
      }
      if Instant::now() >= deadline {
        return Err(DriverError::Timeout(self.page_load_timeout));
      }
      sleep(self.poll_interval).await;
    }
  }

  /// Finished downloads not reported yet with their sizes, oldest first.
  fn new_downloads(&self) -> Result<Vec<(PathBuf, u64)>, DriverError> {
    let seen = self
      .seen
      .lock()
      .map_err(|_| DriverError::Transport("download tracker poisoned".to_string()))?;

    let mut found = Vec::new();
    for entry in std::fs::read_dir(&self.download_dir)? {
      let path = entry?.path();
      if seen.contains(&path) || is_partial(&path) || !path.is_file() {
        continue;
      }
      let metadata = std::fs::metadata(&path)?;
      let modified = metadata.modified().ok();
      found.push((modified, path, metadata.len()));
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path, size)| (path, size)).collect())
  }

  fn mark_seen(&self, path: &Path) {
    if let Ok(mut seen) = self.seen.lock() {
      seen.insert(path.to_path_buf());
    }
  }

  /// Retire everything in the download directory, finished or in flight.
  ///
  /// Runs before every click and after a timed-out wait, so a download that
  /// lands late is never attributed to a later trigger. Files already moved
  /// out drop from the set, so their names can be reused.
  fn retire_existing_downloads(&self) -> Result<(), DriverError> {
    let snapshot = snapshot_downloads(&self.download_dir)?;
    let mut seen = self
      .seen
      .lock()
      .map_err(|_| DriverError::Transport("download tracker poisoned".to_string()))?;
    *seen = snapshot;
    Ok(())
  }

  async fn wait_for_download(&self, timeout: Duration) -> Result<Event, DriverError> {
    let deadline = Instant::now() + timeout;
    // A file counts as finished once its size holds still across two polls
    let mut candidate: Option<(PathBuf, u64)> = None;

    loop {
      let downloads = self.new_downloads()?;
      if let Some((path, size)) = downloads.into_iter().next() {
        match &candidate {
          Some((prev_path, prev_size)) if *prev_path == path && *prev_size == size && size > 0 => {
            self.mark_seen(&path);
            let suggested_name = path
              .file_name()
              .map(|n| n.to_string_lossy().into_owned())
              .unwrap_or_default();
            debug!(file = %suggested_name, size, "download finished");
            return Ok(Event::Download {
              suggested_name,
              handle: path.to_string_lossy().into_owned(),
            });
          }
          _ => candidate = Some((path, size)),
        }
      }

      if Instant::now() >= deadline {
        self.retire_existing_downloads()?;
        return Err(DriverError::Timeout(timeout));
      }
      sleep(self.poll_interval).await;
    }
  }
}

#[async_trait]
impl BrowserDriver for WebDriver {
  async fn navigate(&self, url: &str, wait: WaitCondition) -> Result<(), DriverError> {
    self
      .command(Method::POST, "url", Some(json!({ "url": url })))
      .await?;
    self.wait_for_ready_state(wait).await?;
    if wait == WaitCondition::NetworkIdle {
      sleep(IDLE_SETTLE).await;
    }
    Ok(())
  }

  async fn locate_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError> {
    let value = self
      .command(
        Method::POST,
        "elements",
        Some(json!({ "using": "css selector", "value": selector })),
      )
      .await?;
    Ok(element_handles(&value))
  }

  async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
    self.retire_existing_downloads()?;
    self
      .command(Method::POST, &format!("element/{}/click", element.0), Some(json!({})))
      .await?;
    Ok(())
  }

  async fn wait_for_event(&self, kind: EventKind, timeout: Duration) -> Result<Event, DriverError> {
    match kind {
      EventKind::Download => self.wait_for_download(timeout).await,
      EventKind::Response => Err(DriverError::Unsupported("response events")),
    }
  }

  async fn intercept_requests(
    &self,
    _interceptor: Arc<dyn RequestInterceptor>,
  ) -> Result<(), DriverError> {
    Err(DriverError::Unsupported("request interception"))
  }

  async fn save_download(&self, event: &Event, dest: &Path) -> Result<u64, DriverError> {
    let Event::Download { handle, .. } = event else {
      return Err(DriverError::UnexpectedEvent(format!("{event:?}")));
    };
    let source = PathBuf::from(handle);

    if let Some(parent) = dest.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(&source, dest).await.is_err() {
      // Download dir and output dir may sit on different filesystems
      tokio::fs::copy(&source, dest).await?;
      tokio::fs::remove_file(&source).await?;
    }

    Ok(tokio::fs::metadata(dest).await?.len())
  }
}

fn join(base: &Url, path: &str) -> Result<Url, DriverError> {
  base
    .join(path)
    .map_err(|e| DriverError::Transport(format!("invalid endpoint {path}: {e}")))
}

async fn send(
  client: &Client,
  method: Method,
  url: Url,
  body: Option<Value>,
) -> Result<Value, DriverError> {
  let mut request = client.request(method, url);
  if let Some(body) = body {
    request = request.json(&body);
  }
  let response = request
    .send()
    .await
    .map_err(|e| DriverError::Transport(e.to_string()))?;
  let status = response.status();
  let payload: Value = response
    .json()
    .await
    .map_err(|e| DriverError::Transport(format!("undecodable response ({status}): {e}")))?;

  let value = payload.get("value").cloned().unwrap_or(Value::Null);
  if status.is_success() {
    Ok(value)
  } else {
    Err(protocol_error(&value))
  }
}

/// Map a WebDriver error payload (`{"error": ..., "message": ...}`).
fn protocol_error(value: &Value) -> DriverError {
  let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
  let message = value.get("message").and_then(Value::as_str).unwrap_or_default();

  match code {
    "no such element" | "stale element reference" => DriverError::ElementNotFound(message.to_string()),
    "timeout" | "script timeout" => DriverError::Timeout(Duration::ZERO),
    "unsupported operation" => DriverError::Unsupported("operation"),
    _ => DriverError::Transport(format!("{code}: {message}")),
  }
}

fn element_handles(value: &Value) -> Vec<ElementHandle> {
  value
    .as_array()
    .map(|elements| {
      elements
        .iter()
        .filter_map(|e| e.get(ELEMENT_KEY).and_then(Value::as_str))
        .map(|id| ElementHandle(id.to_string()))
        .collect()
    })
    .unwrap_or_default()
}

/// Every path in `dir`, plus the final name of each in-flight download.
fn snapshot_downloads(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
  let mut paths = HashSet::new();
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if is_partial(&path) {
      paths.insert(path.with_extension(""));
    }
    paths.insert(path);
  }
  Ok(paths)
}

fn is_partial(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|ext| PARTIAL_SUFFIXES.contains(&ext.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn offline_driver(dir: &Path) -> WebDriver {
    let mut driver = WebDriver::with_session(
      Client::new(),
      Url::parse("http://127.0.0.1:9/session/test/").unwrap(),
      dir.to_path_buf(),
      Duration::from_secs(1),
    );
    driver.poll_interval = Duration::from_millis(10);
    driver
  }

  #[test]
  fn test_element_handles() {
    let value = json!([
      { ELEMENT_KEY: "e-1" },
      { "unrelated": "x" },
      { ELEMENT_KEY: "e-2" }
    ]);
    assert_eq!(
      element_handles(&value),
      vec![ElementHandle("e-1".into()), ElementHandle("e-2".into())]
    );
    assert!(element_handles(&Value::Null).is_empty());
  }

  #[test]
  fn test_protocol_error_mapping() {
    let err = protocol_error(&json!({ "error": "no such element", "message": "#viewer" }));
    assert!(matches!(err, DriverError::ElementNotFound(ref m) if m == "#viewer"));

    let err = protocol_error(&json!({ "error": "invalid session id", "message": "gone" }));
    assert!(matches!(err, DriverError::Transport(_)));
  }

  #[test]
  fn test_partial_downloads_are_ignored() {
    assert!(is_partial(Path::new("/d/model.glb.crdownload")));
    assert!(is_partial(Path::new("/d/model.glb.PART")));
    assert!(!is_partial(Path::new("/d/model.glb")));
  }

  #[tokio::test]
  async fn test_download_is_detected_and_saved() {
    let downloads = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    std::fs::write(downloads.path().join("old.glb"), b"stale").unwrap();
    let driver = offline_driver(downloads.path());

    std::fs::write(downloads.path().join("chair.glb.crdownload"), b"partial").unwrap();
    std::fs::write(downloads.path().join("chair.glb"), vec![7u8; 2048]).unwrap();

    let event = driver
      .wait_for_event(EventKind::Download, Duration::from_secs(2))
      .await
      .unwrap();
    let Event::Download { ref suggested_name, .. } = event else {
      panic!("expected a download event");
    };
    assert_eq!(suggested_name, "chair.glb");

    let dest = output.path().join("models").join("Chair_a1_1.glb");
    assert_eq!(driver.save_download(&event, &dest).await.unwrap(), 2048);
    assert!(dest.exists());
    assert!(!downloads.path().join("chair.glb").exists());
  }

  #[tokio::test]
  async fn test_download_wait_times_out() {
    let downloads = TempDir::new().unwrap();
    let driver = offline_driver(downloads.path());

    let err = driver
      .wait_for_event(EventKind::Download, Duration::from_millis(50))
      .await
      .unwrap_err();
    assert!(matches!(err, DriverError::Timeout(_)));
  }

  async fn next_download_name(driver: &WebDriver) -> String {
    match driver
      .wait_for_event(EventKind::Download, Duration::from_secs(2))
      .await
      .unwrap()
    {
      Event::Download { suggested_name, .. } => suggested_name,
      other => panic!("expected a download event, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_late_download_is_not_attributed_to_next_trigger() {
    let downloads = TempDir::new().unwrap();
    let driver = offline_driver(downloads.path());

    let err = driver
      .wait_for_event(EventKind::Download, Duration::from_millis(50))
      .await
      .unwrap_err();
    assert!(matches!(err, DriverError::Timeout(_)));

    // Lands after its wait gave up, before the next trigger click
    std::fs::write(downloads.path().join("variant3.glb"), vec![3u8; 512]).unwrap();
    driver.retire_existing_downloads().unwrap();
    std::fs::write(downloads.path().join("variant4.glb"), vec![4u8; 512]).unwrap();

    assert_eq!(next_download_name(&driver).await, "variant4.glb");
  }

  #[tokio::test]
  async fn test_download_in_flight_at_timeout_is_retired() {
    let downloads = TempDir::new().unwrap();
    let driver = offline_driver(downloads.path());
    let partial = downloads.path().join("variant3.glb.crdownload");
    std::fs::write(&partial, b"half").unwrap();

    assert!(driver
      .wait_for_event(EventKind::Download, Duration::from_millis(50))
      .await
      .is_err());

    std::fs::rename(&partial, downloads.path().join("variant3.glb")).unwrap();
    std::fs::write(downloads.path().join("variant4.glb"), vec![4u8; 512]).unwrap();

    assert_eq!(next_download_name(&driver).await, "variant4.glb");
  }

  #[tokio::test]
  async fn test_saved_download_name_can_be_reused() {
    let downloads = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let driver = offline_driver(downloads.path());

    std::fs::write(downloads.path().join("model.glb"), vec![1u8; 256]).unwrap();
    let event = driver
      .wait_for_event(EventKind::Download, Duration::from_secs(2))
      .await
      .unwrap();
    driver
      .save_download(&event, &output.path().join("first.glb"))
      .await
      .unwrap();

    driver.retire_existing_downloads().unwrap();
    std::fs::write(downloads.path().join("model.glb"), vec![2u8; 256]).unwrap();

    assert_eq!(next_download_name(&driver).await, "model.glb");
  }

  #[tokio::test]
  async fn test_oldest_finished_download_is_reported_first() {
    let downloads = TempDir::new().unwrap();
    let driver = offline_driver(downloads.path());
    let now = std::time::SystemTime::now();

    for (name, age) in [("b.glb", 60), ("a.glb", 30), ("c.glb", 90)] {
      let path = downloads.path().join(name);
      std::fs::write(&path, vec![0u8; 128]).unwrap();
      let file = std::fs::File::options().write(true).open(&path).unwrap();
      file.set_modified(now - Duration::from_secs(age)).unwrap();
    }

    assert_eq!(next_download_name(&driver).await, "c.glb");
    assert_eq!(next_download_name(&driver).await, "b.glb");
  }

  #[tokio::test]
  async fn test_interception_is_unsupported() {
    struct AllowAll;
    impl RequestInterceptor for AllowAll {
      fn decide(&self, _: &crate::driver::ResourceRequest) -> crate::driver::Decision {
        crate::driver::Decision::Allow
      }
      fn on_response(&self, _: &crate::driver::ResourceRequest, _: u16, _: &str) {}
    }

    let downloads = TempDir::new().unwrap();
    let driver = offline_driver(downloads.path());
    let err = driver.intercept_requests(Arc::new(AllowAll)).await.unwrap_err();
    assert!(matches!(err, DriverError::Unsupported(_)));
  }
}
