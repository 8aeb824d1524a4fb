mod agent;
mod cache;
mod config;
mod logging;
mod net;
mod registration;
mod server;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use agent::AgentSettings;
use cache::{CacheStorage, SqliteStorage};
use config::Config;
use net::HttpNetwork;
use registration::Registration;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "An offline-first caching proxy for single-page applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./shellcache.yaml or $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin server to front (overrides config)
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Address to listen on (overrides config)
  #[arg(long, global = true)]
  listen: Option<String>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Increase log verbosity
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
  /// Run the caching proxy (default)
  Serve,
  /// Install and activate the configured version, then exit
  Install,
  /// List cache stores and their entry counts
  Stores,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

  let config = load_config(&args)?;

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(config, args).await,
    Command::Install => install(config).await,
    Command::Stores => stores(&config),
  }
}

/// Load configuration and apply command line overrides.
fn load_config(args: &Args) -> Result<Config> {
  let config = Config::load(args.config.as_deref())?;

  Ok(Config {
    origin: args.origin.clone().or(config.origin),
    listen: args.listen.clone().unwrap_or(config.listen),
    ..config
  })
}

fn open_storage(config: &Config) -> Result<Arc<SqliteStorage>> {
  let path = config.cache_path()?;
  info!(path = %path.display(), "Opening cache");
  Ok(Arc::new(SqliteStorage::open(&path)?))
}

async fn serve(config: Config, args: Args) -> Result<()> {
  let settings = AgentSettings::from_config(&config)?;
  let storage = open_storage(&config)?;
  let network = Arc::new(HttpNetwork::new(&config)?);
  let registration = Arc::new(Registration::new(
    storage,
    Arc::clone(&network),
    config.update.policy,
  ));

  registration::spawn_event_logger(registration.subscribe(), config.update.policy);

  if let Err(e) = registration.start(settings.clone()).await {
    match registration.controller() {
      Some(controller) => warn!(
        version = %controller.version(),
        error = %e,
        "Install failed, previous version keeps serving"
      ),
      None => warn!(error = %e, "Install failed, passing requests through uncached"),
    }
  }

  registration::spawn_update_poller(
    Arc::clone(&registration),
    config.update.interval(),
    move || reload_settings(&args),
  );
  #[cfg(unix)]
  registration::spawn_skip_waiting_listener(Arc::clone(&registration))?;

  let proxy = Arc::new(server::Proxy::new(
    registration,
    network,
    settings.origin.clone(),
  ));
  let app = server::router(proxy);

  let listener = tokio::net::TcpListener::bind(&config.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.listen, e))?;
  info!(listen = %config.listen, origin = %settings.origin, "Serving");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  Ok(())
}

/// Re-read the configuration for an update check.
///
/// The file is searched for again on every call, so one created after
/// startup is picked up.
fn reload_settings(args: &Args) -> Result<AgentSettings> {
  AgentSettings::from_config(&load_config(args)?)
}

async fn install(config: Config) -> Result<()> {
  let settings = AgentSettings::from_config(&config)?;
  let storage = open_storage(&config)?;
  let network = Arc::new(HttpNetwork::new(&config)?);
  let registration = Registration::new(storage, network, config.update.policy);

  let agent = registration.register(settings).await?;
  println!("{} {}", agent.version(), agent.state());
  Ok(())
}

fn stores(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let active = storage.active_store()?;

  for name in storage.store_names()? {
    let marker = if active.as_deref() == Some(name.as_str()) {
      "*"
    } else {
      " "
    };
    println!("{} {}\t{}", marker, name, storage.entry_count(&name)?);
  }

  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "Failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  info!("Shutting down");
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args(config: &std::path::Path) -> Args {
    Args::parse_from([
      "shellcache",
      "--config",
      config.to_str().unwrap(),
      "--origin",
      "https://prep.example.org",
    ])
  }

  #[test]
  fn test_reload_reads_config_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shellcache.yaml");
    std::fs::write(&path, "cache:\n  version: v1\n").unwrap();
    let args = args(&path);

    assert_eq!(reload_settings(&args).unwrap().version, "ham-prep-v1");

    std::fs::write(&path, "cache:\n  version: v2\n").unwrap();
    let settings = reload_settings(&args).unwrap();
    assert_eq!(settings.version, "ham-prep-v2");
    assert_eq!(settings.origin.as_str(), "https://prep.example.org/");
  }

  #[test]
  fn test_reload_fails_when_explicit_config_disappears() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shellcache.yaml");
    std::fs::write(&path, "cache:\n  version: v1\n").unwrap();
    let args = args(&path);
    reload_settings(&args).unwrap();

    std::fs::remove_file(&path).unwrap();
    assert!(reload_settings(&args).is_err());
  }
}
