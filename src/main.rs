use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use harvester::cache::{CacheLayer, CacheManager, NoopStorage};
use harvester::config::Config;
use harvester::driver::{BrowserDriver, RemoteApi};
use harvester::gatekeeper::Gatekeeper;
use harvester::orchestrator::{FingerprintLedger, Orchestrator, OrchestratorOptions, RunState};
use harvester::progress::ProgressStore;
use harvester::remote::HttpApi;
use harvester::webdriver::WebDriver;

#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(about = "Download generated assets from a remote library and clean up after them")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./harvester.yaml or $XDG_CONFIG_HOME/harvester/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log debug output
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// List the items the remote currently offers
  Discover,
  /// Download, verify and delete every pending item
  Run,
  /// Empty the response and content caches
  ResetCache,
  /// Show what the progress file has recorded
  Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config, args.verbose)?;

  match args.command {
    Commands::Discover => discover(&config).await,
    Commands::Run => run(&config).await,
    Commands::ResetCache => reset_cache(&config),
    Commands::Status => status(&config),
  }
}

/// Log to stderr and to a daily file in the job directory.
fn init_logging(config: &Config, verbose: bool) -> Result<WorkerGuard> {
  let log_dir = config.paths.log_dir();
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "harvester.log"));

  let default_level = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("harvester={default_level},warn")));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn build_api(config: &Config, caches: &CacheManager) -> Result<Arc<dyn RemoteApi>> {
  let token = Config::api_token();
  let api: Arc<dyn RemoteApi> = if config.cache.enabled {
    let layer = CacheLayer::new(caches.disk())
      .with_stale_time(chrono::Duration::minutes(config.cache.list_ttl_minutes));
    Arc::new(HttpApi::new(&config.remote, token, layer)?)
  } else {
    Arc::new(HttpApi::new(
      &config.remote,
      token,
      CacheLayer::new(Arc::new(NoopStorage)),
    )?)
  };
  Ok(api)
}

async fn discover(config: &Config) -> Result<ExitCode> {
  let caches = CacheManager::open(&config.paths.cache_dir());
  let api = build_api(config, &caches)?;
  let progress = ProgressStore::open(config.paths.progress_file())?;

  let items = api
    .list_items()
    .await
    .map_err(|e| eyre!("Failed to list items: {}", e))?;

  println!("{} item(s)", items.len());
  for item in &items {
    let statuses: Vec<String> = item
      .wanted_variants(config.batch.variants_per_item)
      .iter()
      .map(|v| format!("{:?}", v.status).to_lowercase())
      .collect();
    let marker = if progress.is_completed(&item.id) {
      " (completed)"
    } else {
      ""
    };
    println!("{}  {}  [{}]{}", item.id, item.title, statuses.join(", "), marker);
  }

  Ok(ExitCode::SUCCESS)
}

async fn run(config: &Config) -> Result<ExitCode> {
  let caches = CacheManager::open(&config.paths.cache_dir());
  let api = build_api(config, &caches)?;
  let progress = ProgressStore::open(config.paths.progress_file())?;
  let ledger = FingerprintLedger::load(config.paths.ledger_file());

  let webdriver = Arc::new(
    WebDriver::connect(&config.webdriver, &config.paths.download_dir())
      .await
      .map_err(|e| eyre!("Failed to start browser session: {}", e))?,
  );
  let driver: Arc<dyn BrowserDriver> = webdriver.clone();

  let cancel = CancellationToken::new();
  let on_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, finishing the current item");
      on_signal.cancel();
    }
  });

  let mut orchestrator = Orchestrator::new(
    driver,
    api,
    progress,
    ledger,
    OrchestratorOptions::from_config(config),
  )
  .with_caches(caches.clone())
  .with_cancellation(cancel);

  if config.gatekeeper.enabled {
    let critical = config.critical_allowlist();
    let gatekeeper = Gatekeeper::from_preset(
      config.gatekeeper.preset,
      &config.gatekeeper.rules,
      critical,
      caches.content(),
    );
    orchestrator = orchestrator.with_gatekeeper(Arc::new(gatekeeper));
  }

  info!(progress = %config.paths.progress_file().display(), "starting run");
  let summary = orchestrator.run_to_completion().await;

  if let Err(e) = webdriver.close().await {
    warn!(error = %e, "browser session not closed cleanly");
  }

  println!("{summary}");
  let code = match summary.state {
    RunState::Done => ExitCode::SUCCESS,
    RunState::Cancelled => ExitCode::from(130),
    _ => ExitCode::FAILURE,
  };
  Ok(code)
}

fn reset_cache(config: &Config) -> Result<ExitCode> {
  let caches = CacheManager::open(&config.paths.cache_dir());
  caches.clear_all();
  println!("Cleared caches in {}", caches.root().display());
  Ok(ExitCode::SUCCESS)
}

fn status(config: &Config) -> Result<ExitCode> {
  let progress = ProgressStore::open(config.paths.progress_file())?;
  let state = progress.state();

  println!("Progress file: {}", progress.path().display());
  println!("Processed: {}", state.processed_count);
  match state.last_updated_at {
    Some(at) => println!("Last updated: {}", at.to_rfc3339()),
    None => println!("Last updated: never"),
  }
  for id in &state.completed_ids {
    println!("  {id}");
  }

  Ok(ExitCode::SUCCESS)
}
