use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use qbsync::cache::{spawn_sweeper, IdentityCache};
use qbsync::config::Config;
use qbsync::schema::{TypeDefinition, TypeRegistry};
use qbsync::source::InMemorySource;
use qbsync::webhook::parse_notifications;
use qbsync::SyncEngine;

#[derive(Parser, Debug)]
#[command(name = "qbsync")]
#[command(about = "Mirror accounting records into a workspace platform")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/qbsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List the registered target types and their capabilities
  Types,
  /// Fetch one page of a full sync
  FullSync {
    #[arg(short = 't', long = "type")]
    type_id: String,
    #[arg(short, long, default_value_t = 1)]
    page: u32,
    /// JSON document of source records keyed by entity
    #[arg(short, long)]
    fixtures: PathBuf,
  },
  /// Pull changes since a timestamp (RFC 3339)
  Incremental {
    #[arg(short, long, value_delimiter = ',')]
    types: Vec<String>,
    #[arg(short, long)]
    since: DateTime<Utc>,
    #[arg(short, long)]
    fixtures: PathBuf,
  },
  /// Turn a webhook notification body into target records
  Replay {
    #[arg(short, long)]
    notifications: PathBuf,
    #[arg(short, long, value_delimiter = ',')]
    types: Vec<String>,
    #[arg(short, long)]
    fixtures: PathBuf,
  },
}

fn init_tracing(log_file: Option<&Path>) -> Result<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qbsync=info"));

  let (writer, guard, ansi) = match log_file {
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      (writer, guard, false)
    }
    None => {
      let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
      (writer, guard, true)
    }
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(ansi)
    .init();

  Ok(guard)
}

fn load_fixtures(path: &Path) -> Result<InMemorySource> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read fixtures {}: {}", path.display(), e))?;
  let document: Value = serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse fixtures {}: {}", path.display(), e))?;
  InMemorySource::from_fixtures(document)
    .map_err(|e| eyre!("Fixtures must map entities to record lists: {}", e))
}

/// Explicit types win, then the configured default set.
fn target_types(requested: Vec<String>, config: &Config) -> Result<Vec<String>> {
  let types = if requested.is_empty() {
    config.target_types.clone()
  } else {
    requested
  };
  if types.is_empty() {
    return Err(eyre!("No target types given and none configured"));
  }
  Ok(types)
}

fn build_engine(config: &Config, registry: Arc<TypeRegistry>, fixtures: &Path) -> Result<SyncEngine> {
  let client = Arc::new(load_fixtures(fixtures)?);
  let identities = Arc::new(IdentityCache::new(config.identity_ttl()));
  spawn_sweeper(Arc::clone(&identities), config.sweep_interval());
  Ok(SyncEngine::new(
    client,
    registry,
    identities,
    config.engine_settings(),
  ))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let registry = Arc::new(TypeRegistry::default_catalog()?);
  info!(workspace = %config.workspace, types = registry.len(), "loaded type registry");

  match args.command {
    Command::Types => {
      let types: Vec<Value> = registry
        .iter()
        .map(|definition| {
          json!({
            "id": definition.id(),
            "name": definition.schema().name,
            "capabilities": definition.capabilities(),
          })
        })
        .collect();
      print_json(&types)?;
    }
    Command::FullSync {
      type_id,
      page,
      fixtures,
    } => {
      let engine = build_engine(&config, registry, &fixtures)?;
      let page = engine
        .full_sync_page(&config.workspace, &type_id, page)
        .await?;
      print_json(&json!({ "records": page.records, "has_more": page.has_more }))?;
    }
    Command::Incremental {
      types,
      since,
      fixtures,
    } => {
      let types = target_types(types, &config)?;
      let engine = build_engine(&config, registry, &fixtures)?;
      let output = engine
        .incremental_sync(&config.workspace, &types, since)
        .await?;
      print_json(&output)?;
    }
    Command::Replay {
      notifications,
      types,
      fixtures,
    } => {
      let types = target_types(types, &config)?;
      let body = std::fs::read(&notifications)
        .map_err(|e| eyre!("Failed to read {}: {}", notifications.display(), e))?;
      let events = parse_notifications(&body, &config.workspace)?;
      info!(events = events.len(), "parsed webhook notifications");

      let engine = build_engine(&config, registry, &fixtures)?;
      let output = engine
        .webhook_transform(&config.workspace, &types, &events)
        .await?;
      print_json(&output)?;
    }
  }

  Ok(())
}
