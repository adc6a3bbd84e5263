mod cache;
mod config;
mod db;
mod logging;
mod net;
mod notify;
mod queue;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use cache::{CacheManager, SqliteStorage};
use config::Config;
use net::{HttpFetcher, Request};
use notify::{ClientChannel, ClientHandle};
use queue::NoteQueue;
use sync::{ConnectivityMonitor, SyncManager, SyncTrigger, SyncWorker, TriggerSender};

#[derive(Parser, Debug)]
#[command(name = "notesync")]
#[command(about = "Offline cache and background note sync for the notes web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/notesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Open partitions, pre-cache the static manifest, delete stale partitions
  Install,
  /// Delete partitions left over from older versions
  Cleanup,
  /// List cache partitions
  Partitions,
  /// Send one request through the interceptor
  Fetch {
    url: Url,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long)]
    accept: Option<String>,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Save a note (JSON object); queued when the backend is unreachable
  Save { note: String },
  /// Show queued notes
  Queue {
    /// Include entries that already synced
    #[arg(long)]
    all: bool,
  },
  /// Delete every queued note, synced or not
  QueueClear,
  /// Run one sync trigger to completion
  Sync {
    /// sync-notes or connectivity-restored
    #[arg(long, default_value = "sync-notes")]
    trigger: String,
  },
  /// Watch connectivity and sync in the background until Ctrl-C
  Run,
}

/// Process-wide services, built once and passed down.
struct Services {
  config: Config,
  fetcher: Arc<HttpFetcher>,
  queue: Arc<NoteQueue>,
  clients: ClientChannel,
  sync: Arc<SyncManager<HttpFetcher>>,
}

impl Services {
  fn new(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let queue = Arc::new(NoteQueue::new(data_dir.join("offline.db")));
    let clients = ClientChannel::new();
    let sync = Arc::new(SyncManager::new(
      Arc::clone(&queue),
      Arc::clone(&fetcher),
      config.sync_endpoint()?,
      clients.clone(),
    ));

    Ok(Self {
      config,
      fetcher,
      queue,
      clients,
      sync,
    })
  }

  fn cache_manager(
    &self,
    triggers: Option<TriggerSender>,
  ) -> Result<CacheManager<SqliteStorage, HttpFetcher>> {
    let storage = Arc::new(SqliteStorage::open(
      &self.config.data_dir()?.join("cache.db"),
    )?);
    let manager = CacheManager::new(
      &self.config,
      storage,
      Arc::clone(&self.fetcher),
      Arc::clone(&self.queue),
    );

    Ok(match triggers {
      Some(triggers) => manager.with_triggers(triggers),
      None => manager,
    })
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let services = Services::new(config)?;

  match args.command {
    Command::Install => install(&services).await,
    Command::Cleanup => cleanup(&services),
    Command::Partitions => partitions(&services),
    Command::Fetch {
      url,
      method,
      navigate,
      accept,
      data,
    } => {
      let request = fetch_request(url, &method, navigate, accept.as_deref(), data.as_deref())?;
      intercept(&services, request).await
    }
    Command::Save { note } => {
      let request = Request::new(Method::POST, services.config.notes_url()?)
        .with_json(&parse_json(&note)?);
      intercept(&services, request).await
    }
    Command::Queue { all } => show_queue(&services, all),
    Command::QueueClear => {
      let removed = services.queue.clear()?;
      println!("Removed {} queued notes", removed);
      Ok(())
    }
    Command::Sync { trigger } => run_trigger(&services, trigger.parse()?).await,
    Command::Run => run(&services).await,
  }
}

/// Build the request for `notesync fetch`.
fn fetch_request(
  url: Url,
  method: &str,
  navigate: bool,
  accept: Option<&str>,
  data: Option<&str>,
) -> Result<Request> {
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

  let mut request = if navigate {
    if method != Method::GET {
      return Err(eyre!("--navigate only applies to GET requests, got {}", method));
    }
    Request::navigate(url)
  } else {
    Request::new(method, url)
  };
  if let Some(accept) = accept {
    request = request.with_header("Accept", accept);
  }
  if let Some(data) = data {
    request = request.with_json(&parse_json(data)?);
  }
  Ok(request)
}

fn parse_json(text: &str) -> Result<serde_json::Value> {
  serde_json::from_str(text).map_err(|e| eyre!("Invalid JSON: {}", e))
}

async fn install(services: &Services) -> Result<()> {
  let cache = services.cache_manager(None)?;
  let report = cache.install().await?;
  let deleted = cache.activate()?;

  println!(
    "Cached {} static assets ({} failed)",
    report.cached, report.failed
  );
  for name in deleted {
    println!("Deleted stale partition {}", name);
  }
  Ok(())
}

fn cleanup(services: &Services) -> Result<()> {
  let deleted = services.cache_manager(None)?.activate()?;
  if deleted.is_empty() {
    println!("No stale partitions");
  }
  for name in deleted {
    println!("Deleted stale partition {}", name);
  }
  Ok(())
}

fn partitions(services: &Services) -> Result<()> {
  for (partition, current) in services.cache_manager(None)?.list_partitions()? {
    println!(
      "{:<32} {:<10} {:>6} entries  {}{}",
      partition.name,
      partition
        .purpose
        .map(|p| p.as_str())
        .unwrap_or("-"),
      partition.entries,
      partition.created_at.format("%Y-%m-%d %H:%M"),
      if current { "" } else { "  (stale)" }
    );
  }
  Ok(())
}

/// Pass a request through the interceptor with a sync worker attached, so a
/// deferred save gets an immediate replay attempt.
async fn intercept(services: &Services, request: Request) -> Result<()> {
  let mut client = services.clients.subscribe();
  let (triggers, worker) = SyncWorker::spawn(Arc::clone(&services.sync));
  let cache = services.cache_manager(Some(triggers))?;

  let result = cache.handle(&request).await;
  cache.settle().await;
  drop(cache);
  worker
    .await
    .map_err(|e| eyre!("Sync worker failed: {}", e))?;

  println!("{} ({:?})", result.data.status, result.source);
  if let Some(cached_at) = result.cached_at {
    println!("cached at {}", cached_at.to_rfc3339());
  }
  println!("{}", result.data.text());
  print_messages(&mut client);
  Ok(())
}

fn show_queue(services: &Services, all: bool) -> Result<()> {
  let entries = if all {
    services.queue.all()?
  } else {
    services.queue.unsynced()?
  };

  if entries.is_empty() {
    println!("Queue is empty");
  }
  for entry in entries {
    let target = entry
      .target
      .as_ref()
      .map(|t| format!("{} {}", t.method, t.url))
      .unwrap_or_else(|| "POST (sync endpoint)".to_string());
    println!(
      "#{:<5} {:<24} {}  {:<7}  {}",
      entry.id,
      entry.note_id.as_deref().unwrap_or("-"),
      entry.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
      if entry.synced { "synced" } else { "pending" },
      target
    );
  }
  Ok(())
}

async fn run_trigger(services: &Services, trigger: SyncTrigger) -> Result<()> {
  let mut client = services.clients.subscribe();

  match services.sync.handle(trigger).await {
    Some(report) => println!(
      "Replayed {} notes: {} synced, {} failed",
      report.attempted, report.synced, report.failed
    ),
    None => println!("Sync did not run, see log"),
  }
  print_messages(&mut client);
  Ok(())
}

async fn run(services: &Services) -> Result<()> {
  let mut client = services.clients.subscribe();
  let (triggers, worker) = SyncWorker::spawn(Arc::clone(&services.sync));
  let mut monitor = ConnectivityMonitor::new(
    Arc::clone(&services.fetcher),
    services.config.probe_url(),
    Duration::from_secs(services.config.sync.probe_interval_secs()),
    Duration::from_secs(services.config.sync.interval_secs()),
    triggers.clone(),
  )
  .spawn();

  // Whatever is already queued goes out first
  triggers.register(SyncTrigger::NoteSync);
  tracing::info!(
    pending = services.queue.count_unsynced().unwrap_or(0),
    clients = services.clients.client_count(),
    "watching connectivity"
  );

  let mut monitor_failure = None;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      result = &mut monitor => {
        let reason = match result {
          Ok(()) => "stopped".to_string(),
          Err(e) => e.to_string(),
        };
        tracing::error!(%reason, "connectivity monitor exited");
        monitor_failure = Some(reason);
        break;
      }
      message = client.recv() => match message {
        Some(message) => {
          let json = serde_json::to_string(&message)
            .map_err(|e| eyre!("Failed to encode client message: {}", e))?;
          tracing::info!(message = %json, "client message");
        }
        None => break,
      },
    }
  }

  if monitor_failure.is_none() {
    monitor.abort();
    if let Err(e) = monitor.await {
      if !e.is_cancelled() {
        tracing::error!("connectivity monitor failed: {}", e);
      }
    }
  }
  drop(triggers);
  worker
    .await
    .map_err(|e| eyre!("Sync worker failed: {}", e))?;

  match monitor_failure {
    Some(reason) => Err(eyre!("Connectivity monitor exited: {}", reason)),
    None => Ok(()),
  }
}

fn print_messages(client: &mut ClientHandle) {
  while let Some(message) = client.try_recv() {
    if let Ok(json) = serde_json::to_string(&message) {
      println!("{}", json);
    }
  }
}
