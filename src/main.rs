use async_trait::async_trait;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tidewater::cache::CacheKey;
use tidewater::queue::EnqueueOptions;
use tidewater::storage::{MemoryStorage, SqliteStorage, Storage};
use tidewater::{
  logging, Config, LayerEvent, OfflineLayer, OptimisticOptions, Priority, QueryFetcher,
};

#[derive(Parser, Debug)]
#[command(name = "tidewater")]
#[command(about = "Offline-resilient mutation queue and query cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tidewater/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show persisted queue metadata and cache size
  Status,
  /// Drive the layer with simulated remote operations
  Simulate {
    /// Number of mutations to submit
    #[arg(long, default_value_t = 12)]
    requests: u32,
    /// Every K-th mutation is rejected by the simulated server (0 = never)
    #[arg(long, default_value_t = 4)]
    fail_every: u32,
    /// Drop connectivity for this long halfway through (0 = stay online)
    #[arg(long, default_value_t = 500)]
    offline_ms: u64,
  },
  /// Remove all persisted state
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  match args.command {
    Command::Status => status(&config),
    Command::Clear => clear(&config),
    Command::Simulate {
      requests,
      fail_every,
      offline_ms,
    } => simulate(config, requests, fail_every, offline_ms).await,
  }
}

fn status(config: &Config) -> Result<()> {
  let path = config.storage_path()?;
  let storage = SqliteStorage::open(&path)?;
  let records = storage.load_queue()?;
  let entries = storage.load_entries()?;

  println!("storage: {}", path.display());
  println!("cached entries: {}", entries.len());
  if records.is_empty() {
    println!("pending requests: none");
  } else {
    println!("pending requests left by a previous run: {}", records.len());
    for record in records {
      println!(
        "  {} priority={} retries={}/{} enqueued={}",
        record.id,
        record.priority,
        record.retry_count,
        record.max_retries,
        record.timestamp.to_rfc3339()
      );
    }
  }
  Ok(())
}

fn clear(config: &Config) -> Result<()> {
  let path = config.storage_path()?;
  SqliteStorage::open(&path)?.clear()?;
  info!(path = %path.display(), "cleared persisted state");
  println!("cleared {}", path.display());
  Ok(())
}

/// Fake remote that serves lists of items and item details.
struct SimulatedRemote;

#[async_trait]
impl QueryFetcher for SimulatedRemote {
  async fn fetch(&self, key: &CacheKey) -> Result<Value> {
    tokio::time::sleep(Duration::from_millis(10)).await;
    match key.parts() {
      [resource, kind] if kind == "list" => Ok(json!((1..=5)
        .map(|id| json!({ "id": id, "resource": resource }))
        .collect::<Vec<_>>())),
      [resource, kind, id] if kind == "detail" => {
        Ok(json!({ "id": id, "resource": resource, "version": 0 }))
      }
      _ => Err(eyre!("no such resource: {}", key)),
    }
  }
}

async fn simulate(config: Config, requests: u32, fail_every: u32, offline_ms: u64) -> Result<()> {
  // Simulations never touch the on-disk state
  let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
  let layer = Arc::new(OfflineLayer::new(config, storage, Arc::new(SimulatedRemote))?);

  let stop = CancellationToken::new();
  let printer = tokio::spawn(print_events(layer.subscribe(), stop.clone()));

  let remote = SimulatedRemote;
  let list = CacheKey::from(["items", "list"]);
  let items = layer.cache().fetch(&list, || remote.fetch(&list)).await?;
  println!("loaded {} from {:?}", list, items.source);
  layer.prefetch(&[list.clone()]).join().await;
  println!("cache warmed: {} entries", layer.cache().len());

  let mut tasks = Vec::new();
  for n in 1..=requests {
    if offline_ms > 0 && n == requests / 2 + 1 {
      layer.network().set_online(false);
    }
    let rejected = fail_every > 0 && n % fail_every == 0;
    tasks.push(tokio::spawn(mutate(Arc::clone(&layer), n, rejected)));
  }

  if offline_ms > 0 {
    tokio::time::sleep(Duration::from_millis(offline_ms)).await;
    layer.network().set_online(true);
  }

  let mut succeeded = 0;
  let mut failed = 0;
  for task in tasks {
    match task.await.map_err(|e| eyre!("Mutation task panicked: {}", e))? {
      Ok(()) => succeeded += 1,
      Err(e) => {
        println!("  {}", e);
        failed += 1;
      }
    }
  }

  let pruned = layer.pruner().prune_on_pressure();
  let stats = layer.queue().stats();

  layer.shutdown();
  stop.cancel();
  printer
    .await
    .map_err(|e| eyre!("Event printer panicked: {}", e))?;

  println!();
  println!("mutations: {} succeeded, {} rolled back", succeeded, failed);
  println!(
    "queue: {} drain passes, {} retries, max concurrent drains {}",
    stats.drain_passes, stats.retried, stats.max_concurrent_drains
  );
  println!("pruned {} cache entries under simulated pressure", pruned.len());
  Ok(())
}

/// Bump an item's version optimistically and confirm it remotely.
async fn mutate(layer: Arc<OfflineLayer>, n: u32, rejected: bool) -> Result<()> {
  let key = CacheKey::from(["items".to_string(), "detail".to_string(), n.to_string()]);
  let priority = match n % 3 {
    0 => Priority::High,
    1 => Priority::Normal,
    _ => Priority::Low,
  };
  let options = OptimisticOptions {
    enqueue: EnqueueOptions::default().priority(priority).max_retries(1),
    ..OptimisticOptions::default()
  };

  layer
    .coordinator()
    .optimistic_update(
      key,
      |old| {
        let mut item = old.cloned().unwrap_or_else(|| json!({ "id": n }));
        let version = item["version"].as_u64().unwrap_or(0);
        item["version"] = json!(version + 1);
        item
      },
      move || async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if rejected {
          Err(eyre!("server rejected item {}", n))
        } else {
          Ok(())
        }
      },
      options,
    )
    .await?;
  Ok(())
}

async fn print_events(
  mut rx: tokio::sync::broadcast::Receiver<LayerEvent>,
  stop: CancellationToken,
) {
  loop {
    let event = tokio::select! {
      _ = stop.cancelled() => break,
      event = rx.recv() => event,
    };
    match event {
      Ok(event) => print_event(&event),
      Err(RecvError::Lagged(skipped)) => println!("  ... {} events skipped", skipped),
      Err(RecvError::Closed) => return,
    }
  }
  while let Ok(event) = rx.try_recv() {
    print_event(&event);
  }
}

fn print_event(event: &LayerEvent) {
  match event {
    LayerEvent::RequestQueued { id, priority } => println!("queued    {} ({})", id, priority),
    LayerEvent::RequestSuccess { id } => println!("success   {}", id),
    LayerEvent::RequestRetry { id, retry_count } => {
      println!("retry     {} (attempt {})", id, retry_count + 1)
    }
    LayerEvent::RequestFailed { id, error } => println!("failed    {}: {}", id, error),
    LayerEvent::QueueProcessing { total } => println!("draining  {} pending", total),
    LayerEvent::QueueProcessed => println!("drained"),
    LayerEvent::NetworkOnline => println!("network   online"),
    LayerEvent::NetworkOffline => println!("network   offline"),
    LayerEvent::CachePruned { removed } => println!("pruned    {} entries", removed.len()),
  }
}
