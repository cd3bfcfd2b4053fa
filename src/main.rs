mod cache;
mod config;
mod event;
mod host;
mod http;
mod network;
mod notify;
mod proxy;
mod router;
mod strategy;
mod sync;
mod tasks;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::{CacheStore, SqliteStorage};
use crate::config::{Config, WorkerConfig};
use crate::event::EventHandler;
use crate::host::LocalHost;
use crate::http::Request;
use crate::network::HttpNetwork;
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline caching and background sync worker for a web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offgrid.yaml, then $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin server to sit in front of
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the intercepting proxy with background and periodic sync
  Serve {
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
  },
  /// Precache the static shell
  Install,
  /// Drop partitions from other versions
  Activate,
  /// Answer a GET request through the worker
  Fetch {
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long)]
    accept: Option<String>,
  },
  /// Queue a submission for later replay
  Enqueue {
    entity_type: String,
    /// JSON payload
    payload: String,
  },
  /// Fire a background sync event (e.g. sync-quotes)
  Sync { tag: String },
  /// Fire a periodic sync event (e.g. update-dashboard)
  Periodic { tag: String },
  /// Show a push notification
  Push { payload: Option<String> },
  /// Click a notification composed from a push payload
  Click {
    /// Action button (`view` or `dismiss`); omit for a click on the body
    #[arg(long)]
    action: Option<String>,
    payload: Option<String>,
  },
  /// Deliver a page message (JSON)
  Message { message: String },
  /// List routing rules, partitions and pending submissions
  Inspect {
    /// Also list every cached entry
    #[arg(long)]
    entries: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }

  let _guard = init_tracing(&config)?;

  let storage = SqliteStorage::open(&config.database_path()?)?;
  let network = HttpNetwork::new(Duration::from_secs(config.network.timeout_secs))?;
  let host = Arc::new(LocalHost::new());
  let worker = Arc::new(Worker::new(
    WorkerConfig::from_config(&config)?,
    CacheStore::new(storage),
    Arc::new(network),
    host.clone(),
  ));

  match args.command {
    Command::Serve { listen } => serve(worker.clone(), host, listen, &config).await?,
    Command::Install => {
      let added = worker.install().await?;
      println!("precached {} entries", added);
    }
    Command::Activate => {
      for name in worker.activate().await? {
        println!("deleted {}", name);
      }
    }
    Command::Fetch {
      path,
      navigate,
      accept,
    } => {
      let url = worker.config().url(&path)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      if let Some(accept) = accept {
        request = request.with_header("accept", &accept);
      }

      let fetched = worker.fetch(&request).await?;
      eprintln!("{} ({})", fetched.response.status, fetched.source);
      println!("{}", fetched.response.text());
    }
    Command::Enqueue {
      entity_type,
      payload,
    } => {
      let payload = parse_json(&payload)?;
      let request = worker
        .enqueue(&entity_type, &payload)
        .ok_or_else(|| eyre!("Failed to queue submission"))?;
      println!("queued {}", request.url);
    }
    Command::Sync { tag } => match worker.sync(&tag).await? {
      Some(report) => println!(
        "attempted {}, replayed {}, failed {}",
        report.attempted, report.replayed, report.failed
      ),
      None => println!("no queue for tag {}", tag),
    },
    Command::Periodic { tag } => match worker.periodic_sync(&tag).await? {
      Some(windows) => println!("dashboard update sent to {} windows", windows),
      None => println!("no periodic task for tag {}", tag),
    },
    Command::Push { payload } => {
      let notification = worker.push(payload.as_deref().map(str::as_bytes)).await?;
      println!("{}: {}", notification.title, notification.body);
    }
    Command::Click { action, payload } => {
      let notification = worker.compose_notification(payload.as_deref().map(str::as_bytes));
      let outcome = worker
        .notification_click(&notification, action.as_deref())
        .await?;
      println!("{:?}", outcome);
    }
    Command::Message { message } => worker.message(&parse_json(&message)?).await?,
    Command::Inspect { entries } => inspect(&worker, entries)?,
  }

  worker.settle().await;
  Ok(())
}

async fn serve(
  worker: Arc<Worker<SqliteStorage>>,
  host: Arc<LocalHost>,
  listen: SocketAddr,
  config: &Config,
) -> Result<()> {
  // The origin may be down at startup; the proxy still serves what is cached
  if let Err(e) = worker.install().await {
    warn!(error = %e, "install failed, keeping existing static cache");
  }
  worker.activate().await?;

  let mut events = EventHandler::new();
  let sync_tags = config
    .sync
    .types
    .iter()
    .map(|t| format!("sync-{}", t))
    .collect();
  events.schedule_sync(
    sync_tags,
    Duration::from_secs(config.sync.retry_interval_secs),
  );
  events.schedule_periodic(host.periodic_registrations());

  let sender = events.sender();
  let dispatcher = worker.clone();
  tokio::spawn(async move {
    while let Some(event) = events.next().await {
      dispatcher.dispatch(event).await;
    }
  });

  proxy::serve(worker, host, sender, listen).await?;
  info!("proxy stopped");
  Ok(())
}

fn inspect(worker: &Worker<SqliteStorage>, show_entries: bool) -> Result<()> {
  println!("rules:");
  for rule in worker.router().rules() {
    println!("  {}\t{:?}", rule.name, rule.route);
  }

  println!("partitions:");
  let store = worker.store();
  for name in store.partition_names()? {
    println!("  {}\t{}", name, store.len(&name)?);
    if show_entries {
      for entry in store.entries(&name)? {
        println!(
          "    {}\t{}\t{}",
          entry.cached_at.to_rfc3339(),
          entry.response.status,
          entry.request.url
        );
      }
    }
  }

  println!("pending submissions:");
  for entity_type in &worker.config().sync_types {
    println!("  {}\t{}", entity_type, worker.pending_submissions(entity_type)?);
  }
  Ok(())
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON: {}", e))
}

/// Log to stderr, or to daily files when `logging.dir` is set. The returned
/// guard flushes the file writer on drop.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offgrid=info"));

  match &config.logging.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offgrid.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(None)
    }
  }
}
