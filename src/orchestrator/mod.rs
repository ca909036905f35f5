//! Batch orchestrator: discover items, download every wanted variant, delete
//! fully downloaded items remotely, and record them in the progress store.
//!
//! One item is processed at a time. The remote list shifts after every
//! deletion, so discovery is re-queried after each batch.

mod convert;
mod dedup;
mod retry;
mod summary;

pub use convert::{ConvertError, Converter};
pub use dedup::{fingerprint, Fingerprint, FingerprintLedger, PREFIX_BYTES};
pub use retry::RetryPolicy;
pub use summary::{RunState, RunSummary};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheManager;
use crate::config::{Config, SelectorsConfig};
use crate::driver::{
  ApiError, BrowserDriver, DriverError, ElementHandle, EventKind, RemoteApi, WaitCondition,
};
use crate::gatekeeper::Gatekeeper;
use crate::item::{Item, ItemId, Variant, VariantStatus};
use crate::progress::{ProgressError, ProgressStore};

/// Knobs for one orchestrated run
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
  pub variants_per_item: usize,
  pub min_file_size: u64,
  pub items_per_batch: usize,
  pub format: String,
  pub step_timeout: Duration,
  pub download_timeout: Duration,
  /// Bound on a single listing or deletion call
  pub api_timeout: Duration,
  pub max_attempts_per_item: u32,
  pub output_dir: PathBuf,
  /// Page opened before an item is processed; `{id}` is replaced
  pub item_page: Option<String>,
  pub selectors: SelectorsConfig,
  pub discovery_retry: RetryPolicy,
  /// Run on each verified artifact not already in the converter's format
  pub converter: Option<Converter>,
}

impl OrchestratorOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      variants_per_item: config.batch.variants_per_item,
      min_file_size: config.batch.min_file_size_bytes,
      items_per_batch: config.batch.items_per_batch,
      format: config.batch.format.clone(),
      step_timeout: config.batch.step_timeout(),
      download_timeout: config.batch.download_timeout(),
      api_timeout: Duration::from_secs(
        config.remote.request_timeout_secs + config.batch.step_timeout_secs,
      ),
      max_attempts_per_item: config.batch.max_attempts_per_item,
      output_dir: config.paths.output_dir(),
      item_page: config.remote.item_page().map(str::to_string),
      selectors: config.selectors.clone(),
      discovery_retry: RetryPolicy::from(&config.retry),
      converter: config.convert.as_ref().map(Converter::from_config),
    }
  }

  fn page_for(&self, item_id: &str) -> Option<String> {
    self.item_page.as_ref().map(|p| p.replace("{id}", item_id))
  }

  fn active_converter(&self) -> Option<&Converter> {
    self.converter.as_ref().filter(|c| c.applies_to(&self.format))
  }
}

/// A single driver interaction within variant processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  Navigate,
  LocateVariants,
  OpenViewer,
  SelectFormat,
  TriggerDownload,
  AwaitDownload,
  SaveDownload,
  Verify,
  Convert,
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Step::Navigate => "navigate",
      Step::LocateVariants => "locate-variants",
      Step::OpenViewer => "open-viewer",
      Step::SelectFormat => "select-format",
      Step::TriggerDownload => "trigger-download",
      Step::AwaitDownload => "await-download",
      Step::SaveDownload => "save-download",
      Step::Verify => "verify",
      Step::Convert => "convert",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Error)]
pub enum StepError {
  #[error("{step} timed out after {timeout:?}")]
  Timeout { step: Step, timeout: Duration },
  #[error("{step} failed: {source}")]
  Driver {
    step: Step,
    #[source]
    source: DriverError,
  },
  #[error("{step}: no element {index} for selector `{selector}`")]
  MissingElement {
    step: Step,
    selector: String,
    index: usize,
  },
  #[error("variant is not ready (status {0:?})")]
  NotReady(VariantStatus),
  #[error("artifact is {size} bytes, below the {min} byte minimum")]
  TooSmall { size: u64, min: u64 },
  #[error("conversion failed: {0}")]
  Convert(#[source] ConvertError),
}

impl StepError {
  pub fn step(&self) -> Step {
    match self {
      StepError::Timeout { step, .. }
      | StepError::Driver { step, .. }
      | StepError::MissingElement { step, .. } => *step,
      StepError::NotReady(_) => Step::OpenViewer,
      StepError::TooSmall { .. } => Step::Verify,
      StepError::Convert(_) => Step::Convert,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantFailure {
  /// Zero-based position in the item's variant list
  pub index: usize,
  pub step: Step,
  pub reason: String,
}

/// Result of processing one item's wanted variants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemOutcome {
  pub wanted: usize,
  pub verified: Vec<usize>,
  pub failed: Vec<VariantFailure>,
}

impl ItemOutcome {
  /// Every wanted variant verified. An item with nothing to download is
  /// never complete.
  pub fn is_complete(&self) -> bool {
    self.wanted > 0 && self.failed.is_empty() && self.verified.len() == self.wanted
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
  /// Deleted remotely and recorded
  Completed,
  /// Some variants failed; nothing deleted or recorded
  Partial,
  /// Downloads verified but the remote deletion failed; nothing recorded
  DeletionFailed,
}

/// Run `fut` under `timeout`, attributing failures to `step`.
async fn bounded<T, F>(step: Step, timeout: Duration, fut: F) -> Result<T, StepError>
where
  F: Future<Output = Result<T, DriverError>>,
{
  match tokio::time::timeout(timeout, fut).await {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(DriverError::Timeout(_))) | Err(_) => Err(StepError::Timeout { step, timeout }),
    Ok(Err(source)) => Err(StepError::Driver { step, source }),
  }
}

async fn bounded_api<T, F>(timeout: Duration, fut: F) -> Result<T, ApiError>
where
  F: Future<Output = Result<T, ApiError>>,
{
  tokio::time::timeout(timeout, fut)
    .await
    .unwrap_or(Err(ApiError::Timeout(timeout)))
}

pub struct Orchestrator {
  driver: Arc<dyn BrowserDriver>,
  api: Arc<dyn RemoteApi>,
  progress: ProgressStore,
  ledger: FingerprintLedger,
  options: OrchestratorOptions,
  caches: Option<CacheManager>,
  gatekeeper: Option<Arc<Gatekeeper>>,
  cancel: CancellationToken,
  state: RunState,
  /// Whether a discovery has succeeded in this run
  listed: bool,
  attempts: HashMap<ItemId, u32>,
  skipped: HashSet<ItemId>,
  summary: RunSummary,
}

impl Orchestrator {
  pub fn new(
    driver: Arc<dyn BrowserDriver>,
    api: Arc<dyn RemoteApi>,
    progress: ProgressStore,
    ledger: FingerprintLedger,
    options: OrchestratorOptions,
  ) -> Self {
    Self {
      driver,
      api,
      progress,
      ledger,
      options,
      caches: None,
      gatekeeper: None,
      cancel: CancellationToken::new(),
      state: RunState::Idle,
      listed: false,
      attempts: HashMap::new(),
      skipped: HashSet::new(),
      summary: RunSummary::default(),
    }
  }

  /// Caches whose stats are reported at the end of the run.
  pub fn with_caches(mut self, caches: CacheManager) -> Self {
    self.caches = Some(caches);
    self
  }

  pub fn with_gatekeeper(mut self, gatekeeper: Arc<Gatekeeper>) -> Self {
    self.gatekeeper = Some(gatekeeper);
    self
  }

  /// Checked between items; the item in flight always finishes.
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn state(&self) -> RunState {
    self.state
  }

  pub fn progress(&self) -> &ProgressStore {
    &self.progress
  }

  fn set_state(&mut self, next: RunState) {
    if self.state != next {
      debug!(from = %self.state, to = %next, "state");
      self.state = next;
    }
  }

  /// Query the remote for the items it currently lists.
  ///
  /// The first successful discovery may be answered from the listing cache.
  /// Later ones always go to the remote, since variant statuses change
  /// between passes.
  pub async fn discover_pending(&mut self) -> Result<Vec<Item>, ApiError> {
    self.set_state(RunState::Discovering);
    let listing = if self.listed {
      self.api.refresh_items()
    } else {
      self.api.list_items()
    };
    let items = bounded_api(self.options.api_timeout, listing).await?;
    self.listed = true;
    debug!(count = items.len(), "discovered items");
    Ok(items)
  }

  /// Download and verify the item's wanted variants in listed order.
  ///
  /// Failures are recorded per variant and never abort the item's other
  /// variants.
  pub async fn process_item(&mut self, item: &Item) -> ItemOutcome {
    self.set_state(RunState::ProcessingItem);
    let wanted = item.wanted_variants(self.options.variants_per_item);
    let mut outcome = ItemOutcome {
      wanted: wanted.len(),
      ..ItemOutcome::default()
    };
    info!(item_id = %item.id, title = %item.title, variants = wanted.len(), "processing item");

    if let Some(page) = self.options.page_for(&item.id) {
      let nav = bounded(
        Step::Navigate,
        self.options.step_timeout,
        self.driver.navigate(&page, WaitCondition::NetworkIdle),
      )
      .await;
      if let Err(e) = nav {
        warn!(item_id = %item.id, step = %e.step(), error = %e, "item page unavailable");
        outcome.failed = (0..wanted.len())
          .map(|index| VariantFailure {
            index,
            step: e.step(),
            reason: e.to_string(),
          })
          .collect();
        return outcome;
      }
    }

    for (index, variant) in wanted.iter().enumerate() {
      match self.process_variant(item, index, variant).await {
        Ok(()) => outcome.verified.push(index),
        Err(e) => {
          warn!(
            item_id = %item.id,
            variant = index + 1,
            step = %e.step(),
            error = %e,
            "variant failed"
          );
          outcome.failed.push(VariantFailure {
            index,
            step: e.step(),
            reason: e.to_string(),
          });
        }
      }
      self.close_viewer().await;
    }

    outcome
  }

  async fn process_variant(
    &mut self,
    item: &Item,
    index: usize,
    variant: &Variant,
  ) -> Result<(), StepError> {
    let name = item.artifact_name(index, &self.options.format);
    let dest = self.options.output_dir.join(&name);

    if self.already_verified(&name, &dest).await {
      info!(item_id = %item.id, variant = index + 1, file = %name, "already downloaded, skipping");
      return Ok(());
    }
    if !variant.is_ready() {
      return Err(StepError::NotReady(variant.status));
    }

    let viewer = self
      .element_at(Step::LocateVariants, &self.options.selectors.variant, index)
      .await?;
    self.click(Step::OpenViewer, &viewer).await?;

    let format_selector = self
      .options
      .selectors
      .format_option
      .replace("{format}", &self.options.format);
    let option = self.element_at(Step::SelectFormat, &format_selector, 0).await?;
    self.click(Step::SelectFormat, &option).await?;

    let button = self
      .element_at(Step::TriggerDownload, &self.options.selectors.download_button, 0)
      .await?;
    self.click(Step::TriggerDownload, &button).await?;

    let download_timeout = self.options.download_timeout;
    let event = bounded(
      Step::AwaitDownload,
      download_timeout + self.options.step_timeout,
      self.driver.wait_for_event(EventKind::Download, download_timeout),
    )
    .await?;

    self.set_state(RunState::Verifying);
    let size = bounded(
      Step::SaveDownload,
      self.options.step_timeout,
      self.driver.save_download(&event, &dest),
    )
    .await?;

    if size < self.options.min_file_size {
      if let Err(e) = tokio::fs::remove_file(&dest).await {
        debug!(file = %dest.display(), error = %e, "could not remove undersized artifact");
      }
      return Err(StepError::TooSmall {
        size,
        min: self.options.min_file_size,
      });
    }

    if let Some(converter) = self.options.active_converter() {
      converter.convert(&dest).await.map_err(StepError::Convert)?;
    }

    match fingerprint(&dest).await {
      Some(fp) => {
        self.ledger.record(&name, fp);
      }
      None => warn!(file = %dest.display(), "could not fingerprint verified artifact"),
    }
    info!(item_id = %item.id, variant = index + 1, file = %name, size, "variant verified");
    self.set_state(RunState::ProcessingItem);

    Ok(())
  }

  async fn already_verified(&self, name: &str, dest: &std::path::Path) -> bool {
    if self.ledger.is_empty() {
      return false;
    }
    let matches = match fingerprint(dest).await {
      Some(fp) => self.ledger.matches(name, &fp),
      None => false,
    };
    match self.options.active_converter() {
      Some(converter) if matches => tokio::fs::try_exists(converter.output_for(dest))
        .await
        .unwrap_or(false),
      _ => matches,
    }
  }

  async fn element_at(
    &self,
    step: Step,
    selector: &str,
    index: usize,
  ) -> Result<ElementHandle, StepError> {
    let found = bounded(step, self.options.step_timeout, self.driver.locate_all(selector)).await?;
    found
      .into_iter()
      .nth(index)
      .ok_or_else(|| StepError::MissingElement {
        step,
        selector: selector.to_string(),
        index,
      })
  }

  async fn click(&self, step: Step, element: &ElementHandle) -> Result<(), StepError> {
    bounded(step, self.options.step_timeout, self.driver.click(element)).await
  }

  async fn close_viewer(&self) {
    let Some(selector) = self.options.selectors.close_viewer.clone() else {
      return;
    };
    let closed = match self.element_at(Step::OpenViewer, &selector, 0).await {
      Ok(button) => self.click(Step::OpenViewer, &button).await,
      Err(e) => Err(e),
    };
    if let Err(e) = closed {
      debug!(error = %e, "viewer not closed");
    }
  }

  /// Delete a fully verified item remotely, then record it.
  ///
  /// Partial items are left untouched. A failed deletion is not recorded, so
  /// a later pass retries it; the downloaded files stay in place.
  pub async fn complete_item(
    &mut self,
    item: &Item,
    outcome: &ItemOutcome,
  ) -> Result<Completion, ProgressError> {
    if !outcome.is_complete() {
      info!(
        item_id = %item.id,
        verified = outcome.verified.len(),
        wanted = outcome.wanted,
        "item incomplete, leaving for retry"
      );
      self.summary.note_partial(&item.id);
      return Ok(Completion::Partial);
    }

    self.set_state(RunState::Deleting);
    let ids = [item.id.clone()];
    if let Err(e) = bounded_api(self.options.api_timeout, self.api.delete_items(&ids)).await {
      error!(
        item_id = %item.id,
        error = %e,
        "remote deletion failed; artifacts kept, item not recorded"
      );
      self.summary.note_deletion_failure(&item.id);
      return Ok(Completion::DeletionFailed);
    }

    self.set_state(RunState::Persisting);
    self.progress.record_completed(&item.id)?;
    self.summary.note_completed(&item.id);
    info!(
      item_id = %item.id,
      processed = self.progress.state().processed_count,
      "item completed"
    );

    Ok(Completion::Completed)
  }

  /// Process items until discovery has nothing left to offer, discovery
  /// keeps failing, or the run is cancelled.
  pub async fn run_to_completion(&mut self) -> RunSummary {
    self.install_gatekeeper().await;

    let policy = self.options.discovery_retry;
    let mut failures = 0u32;

    let terminal = 'run: loop {
      if self.cancel.is_cancelled() {
        break RunState::Cancelled;
      }

      let items = match self.discover_pending().await {
        Ok(items) => {
          failures = 0;
          items
        }
        Err(e) => {
          failures += 1;
          if policy.exhausted(failures) {
            error!(attempts = failures, error = %e, "discovery failed, giving up");
            self.summary.fatal = Some(format!("discovery failed {failures} times: {e}"));
            break RunState::Failed;
          }

          self.set_state(RunState::Retrying);
          let delay = policy.delay_for_attempt(failures);
          warn!(attempt = failures, ?delay, error = %e, "discovery failed, retrying");
          tokio::select! {
            _ = self.cancel.cancelled() => break 'run RunState::Cancelled,
            _ = tokio::time::sleep(delay) => continue 'run,
          }
        }
      };

      let pending = self.select_pending(items);
      if pending.is_empty() {
        self.set_state(RunState::Draining);
        break RunState::Done;
      }

      for item in pending {
        if self.cancel.is_cancelled() {
          break 'run RunState::Cancelled;
        }

        *self.attempts.entry(item.id.clone()).or_insert(0) += 1;
        self.summary.note_attempt(&item.id);

        let outcome = self.process_item(&item).await;
        if let Err(e) = self.complete_item(&item, &outcome).await {
          error!(item_id = %item.id, error = %e, "progress could not be persisted");
          self.summary.fatal = Some(e.to_string());
          break 'run RunState::Failed;
        }
      }
    };

    self.finish(terminal)
  }

  /// Items to process this pass, in discovery order.
  fn select_pending(&mut self, items: Vec<Item>) -> Vec<Item> {
    let mut pending = Vec::new();
    for item in items {
      if self.progress.is_completed(&item.id) {
        if self.skipped.insert(item.id.clone()) {
          debug!(item_id = %item.id, "already completed, skipping");
        }
        continue;
      }
      let attempts = self.attempts.get(&item.id).copied().unwrap_or(0);
      if attempts >= self.options.max_attempts_per_item {
        continue;
      }
      pending.push(item);
      if pending.len() == self.options.items_per_batch {
        break;
      }
    }
    pending
  }

  async fn install_gatekeeper(&self) {
    let Some(gatekeeper) = &self.gatekeeper else {
      return;
    };
    let interceptor: Arc<dyn crate::driver::RequestInterceptor> = gatekeeper.clone();
    match self.driver.intercept_requests(interceptor).await {
      Ok(()) => debug!("gatekeeper installed"),
      Err(DriverError::Unsupported(what)) => {
        info!(%what, "driver cannot intercept requests, running without gatekeeper")
      }
      Err(e) => warn!(error = %e, "gatekeeper not installed"),
    }
  }

  fn finish(&mut self, terminal: RunState) -> RunSummary {
    self.set_state(terminal);
    self.summary.state = terminal;
    self.summary.skipped = self.skipped.len();

    if let Some(caches) = &self.caches {
      caches.log_stats();
    }
    if let Some(gatekeeper) = &self.gatekeeper {
      gatekeeper.log_counters();
    }
    info!(
      state = %terminal,
      attempted = self.summary.attempted.len(),
      completed = self.summary.completed.len(),
      partial = self.summary.partial.len(),
      deletion_failures = self.summary.deletion_failures.len(),
      skipped = self.summary.skipped,
      "run finished"
    );

    self.summary.clone()
  }
}
