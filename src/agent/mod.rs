//! The offline cache agent: one instance per deployed version.
//!
//! An agent seeds its named store on install, removes every other store on
//! activation, and answers cacheable requests network-first.

mod classify;
mod lifecycle;

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

pub use classify::Classification;
pub use lifecycle::WorkerState;

use classify::{classify, ExclusionSet};
use lifecycle::Lifecycle;

use crate::cache::{CacheKey, CacheLayer, CacheResult, CacheStorage, EntryKey};
use crate::config::Config;
use crate::net::{Network, Request};

/// Everything that distinguishes one agent version from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
  /// Store name for this version (e.g. "ham-prep-v1")
  pub version: String,
  /// The agent's own origin
  pub origin: Url,
  pub seed_assets: Vec<String>,
  pub exclude: Vec<String>,
  pub skip_waiting: bool,
}

impl AgentSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      version: config.version_tag(),
      origin: config.origin_url()?,
      seed_assets: config.seed_assets.clone(),
      exclude: config.exclude.clone(),
      skip_waiting: config.skip_waiting,
    })
  }
}

/// What the agent did with a request.
#[derive(Debug)]
pub enum Interception {
  /// Not intercepted; the request takes the default network path
  Bypass(Classification),
  /// Answered by the network-first strategy
  Respond(CacheResult),
}

/// Stores touched while activating.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Activation {
  pub deleted: Vec<String>,
  pub failed: Vec<String>,
}

pub struct Agent<S: CacheStorage, N: Network> {
  settings: AgentSettings,
  exclusions: ExclusionSet,
  storage: Arc<S>,
  network: Arc<N>,
  cache: CacheLayer<S>,
  lifecycle: Lifecycle,
}

impl<S: CacheStorage + 'static, N: Network> Agent<S, N> {
  /// A fresh agent that still has to be installed.
  pub fn new(settings: AgentSettings, storage: Arc<S>, network: Arc<N>) -> Self {
    Self::with_state(settings, storage, network, WorkerState::Parsed)
  }

  /// An agent for a store that was activated by an earlier process.
  pub fn restored(settings: AgentSettings, storage: Arc<S>, network: Arc<N>) -> Self {
    Self::with_state(settings, storage, network, WorkerState::Activated)
  }

  fn with_state(
    settings: AgentSettings,
    storage: Arc<S>,
    network: Arc<N>,
    state: WorkerState,
  ) -> Self {
    let exclusions = ExclusionSet::new(settings.exclude.iter().cloned());
    let cache = CacheLayer::new(Arc::clone(&storage), settings.version.clone());

    Self {
      settings,
      exclusions,
      storage,
      network,
      cache,
      lifecycle: Lifecycle::new(state),
    }
  }

  pub fn version(&self) -> &str {
    &self.settings.version
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  /// Receiver that observes this agent's state changes.
  pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
    self.lifecycle.subscribe()
  }

  /// Whether this version activates right after install.
  pub fn skip_waiting(&self) -> bool {
    self.settings.skip_waiting
  }

  /// Open the store and seed it with every seed asset.
  ///
  /// All seeds are fetched before anything is written; a network error or a
  /// non-200 status on any of them fails the install and leaves the store
  /// without a new generation. The agent is then redundant.
  pub async fn install(&self) -> Result<usize> {
    self.lifecycle.transition(WorkerState::Installing)?;
    info!(
      version = %self.version(),
      seeds = self.settings.seed_assets.len(),
      "Installing"
    );

    match self.seed().await {
      Ok(count) => {
        self.lifecycle.transition(WorkerState::Installed)?;
        info!(version = %self.version(), entries = count, "Installed");
        Ok(count)
      }
      Err(e) => {
        let _ = self.lifecycle.transition(WorkerState::Redundant);
        warn!(version = %self.version(), error = %e, "Install failed");
        Err(e)
      }
    }
  }

  async fn seed(&self) -> Result<usize> {
    let requests = self
      .settings
      .seed_assets
      .iter()
      .map(|path| self.seed_request(path))
      .collect::<Result<Vec<_>>>()?;

    self.storage.open_store(self.version())?;

    let fetches = requests.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.is_cacheable() {
        return Err(eyre!(
          "Seed asset {} returned {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.entry_key(), response))
    });
    let entries = try_join_all(fetches).await?;

    self.storage.put_entries(self.version(), &entries)?;
    Ok(entries.len())
  }

  fn seed_request(&self, path: &str) -> Result<Request> {
    let url = self
      .settings
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid seed asset path '{}': {}", path, e))?;
    Ok(Request::get(url))
  }

  /// Delete every store but this version's and record it as active.
  ///
  /// Cleanup is best-effort: a store that cannot be deleted is logged and
  /// skipped, and activation still completes.
  pub async fn activate(&self) -> Result<Activation> {
    self.lifecycle.transition(WorkerState::Activating)?;

    let mut activation = Activation::default();
    match self.storage.store_names() {
      Ok(names) => {
        for name in names.into_iter().filter(|n| n != self.version()) {
          match self.storage.delete_store(&name) {
            Ok(_) => {
              debug!(store = %name, "Deleted stale store");
              activation.deleted.push(name);
            }
            Err(e) => {
              warn!(store = %name, error = %e, "Failed to delete stale store");
              activation.failed.push(name);
            }
          }
        }
      }
      Err(e) => warn!(error = %e, "Failed to list stores, skipping cleanup"),
    }

    if let Err(e) = self.storage.set_active_store(self.version()) {
      warn!(version = %self.version(), error = %e, "Failed to record active store");
    }

    self.lifecycle.transition(WorkerState::Activated)?;
    info!(
      version = %self.version(),
      deleted = activation.deleted.len(),
      failed = activation.failed.len(),
      "Activated"
    );

    Ok(activation)
  }

  /// Mark this agent as superseded or abandoned.
  pub fn retire(&self) {
    if self.lifecycle.transition(WorkerState::Redundant).is_ok() {
      debug!(version = %self.version(), "Retired");
    }
  }

  /// Decide what to do with one request and, if cacheable, answer it.
  pub async fn handle(&self, request: &Request) -> Interception {
    let class = classify(request, &self.settings.origin, &self.exclusions);
    if !class.is_cacheable() {
      debug!(method = %request.method, url = %request.url, ?class, "Bypassing");
      return Interception::Bypass(class);
    }

    let shell = request.is_navigation().then(|| self.shell_key());
    let result = self
      .cache
      .network_first(request.entry_key(), shell, || self.network.fetch(request))
      .await;

    debug!(
      url = %request.url,
      source = ?result.source,
      status = %result.response.status,
      cached_at = ?result.cached_at,
      "Served"
    );
    Interception::Respond(result)
  }

  /// Key of the root document used for offline navigations.
  fn shell_key(&self) -> EntryKey {
    Request::get(self.settings.origin.clone()).entry_key()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::testing::{get, html, navigate, settings, FakeNetwork, ORIGIN};
  use reqwest::{Method, StatusCode};

  type TestAgent = Agent<SqliteStorage, FakeNetwork>;

  fn setup(seeds: &[&str]) -> (TestAgent, Arc<SqliteStorage>, Arc<FakeNetwork>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let agent = Agent::new(
      settings("ham-prep-v1", seeds),
      Arc::clone(&storage),
      Arc::clone(&network),
    );
    (agent, storage, network)
  }

  async fn activated(seeds: &[&str]) -> (TestAgent, Arc<SqliteStorage>, Arc<FakeNetwork>) {
    let (agent, storage, network) = setup(seeds);
    for seed in seeds {
      network.serve(seed, html(&format!("seed {}", seed)));
    }
    agent.install().await.unwrap();
    agent.activate().await.unwrap();
    (agent, storage, network)
  }

  fn respond(interception: Interception) -> CacheResult {
    match interception {
      Interception::Respond(result) => result,
      Interception::Bypass(class) => panic!("expected a response, got bypass: {:?}", class),
    }
  }

  #[tokio::test]
  async fn test_install_seeds_every_asset() {
    let (agent, storage, network) = setup(&["/", "/manifest.json"]);
    network.serve("/", html("<div id=root>"));
    network.serve("/manifest.json", html("{}"));

    assert_eq!(agent.install().await.unwrap(), 2);
    assert_eq!(agent.state(), WorkerState::Installed);
    assert_eq!(storage.entry_count("ham-prep-v1").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_install_is_idempotent() {
    let seeds = ["/", "/manifest.json"];
    let (agent, storage, network) = setup(&seeds);
    network.serve("/", html("a"));
    network.serve("/manifest.json", html("b"));
    agent.install().await.unwrap();

    let again = Agent::new(
      settings("ham-prep-v1", &seeds),
      Arc::clone(&storage),
      Arc::clone(&network),
    );
    again.install().await.unwrap();
    assert_eq!(storage.entry_count("ham-prep-v1").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_install_fails_when_any_seed_fails() {
    let (agent, storage, network) = setup(&["/", "/manifest.json", "/icons/icon-192.png"]);
    network.serve("/", html("a"));
    network.serve("/manifest.json", html("b"));
    // icon is not served -> 404

    assert!(agent.install().await.is_err());
    assert_eq!(agent.state(), WorkerState::Redundant);
    assert_eq!(storage.entry_count("ham-prep-v1").unwrap(), 0);
    assert!(agent.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_install_fails_when_offline() {
    let (agent, storage, network) = setup(&["/"]);
    network.serve("/", html("a"));
    network.set_offline(true);

    assert!(agent.install().await.is_err());
    assert_eq!(storage.entry_count("ham-prep-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_deletes_other_stores() {
    let (agent, storage, network) = setup(&["/"]);
    network.serve("/", html("a"));
    storage.open_store("old-v1").unwrap();
    storage.open_store("old-v2").unwrap();

    agent.install().await.unwrap();
    let activation = agent.activate().await.unwrap();

    assert_eq!(activation.deleted, vec!["old-v1", "old-v2"]);
    assert!(activation.failed.is_empty());
    assert_eq!(storage.store_names().unwrap(), vec!["ham-prep-v1"]);
    assert_eq!(
      storage.active_store().unwrap().as_deref(),
      Some("ham-prep-v1")
    );
    assert_eq!(agent.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_online_200_is_returned_and_stored() {
    let (agent, storage, network) = activated(&["/"]).await;
    network.serve("/app.js", html("fresh"));

    let result = respond(agent.handle(&get("/app.js")).await);
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.response.body.as_ref(), b"fresh");

    result.write.unwrap().await.unwrap();
    let stored = storage
      .match_entry("ham-prep-v1", &get("/app.js").entry_key())
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body.as_ref(), b"fresh");
  }

  #[tokio::test]
  async fn test_network_beats_cache_when_online() {
    let (agent, _storage, network) = activated(&["/"]).await;
    network.serve("/", html("new shell"));

    let result = respond(agent.handle(&navigate("/")).await);
    assert_eq!(result.response.body.as_ref(), b"new shell");
  }

  #[tokio::test]
  async fn test_excluded_requests_never_touch_store() {
    let (agent, storage, network) = activated(&["/"]).await;
    network.serve("/rest/v1/questions", html("[]"));
    let before = storage.entry_count("ham-prep-v1").unwrap();

    let interception = agent.handle(&get("/rest/v1/questions")).await;
    assert!(matches!(
      interception,
      Interception::Bypass(Classification::Excluded)
    ));
    assert_eq!(network.calls("/rest/v1/questions"), 0);
    assert_eq!(storage.entry_count("ham-prep-v1").unwrap(), before);
  }

  #[tokio::test]
  async fn test_non_get_and_cross_origin_are_bypassed() {
    let (agent, _storage, _network) = activated(&["/"]).await;

    let mut post = get("/api/answers");
    post.method = Method::POST;
    assert!(matches!(
      agent.handle(&post).await,
      Interception::Bypass(Classification::NonGet)
    ));

    let cross = Request::get(Url::parse("https://fonts.example.com/inter.woff2").unwrap());
    assert!(matches!(
      agent.handle(&cross).await,
      Interception::Bypass(Classification::CrossOrigin)
    ));
  }

  #[tokio::test]
  async fn test_offline_serves_prior_entry_unchanged() {
    let (agent, _storage, network) = activated(&["/"]).await;
    let mut served = html("app code");
    served.headers.insert(
      "content-type",
      reqwest::header::HeaderValue::from_static("application/javascript"),
    );
    network.serve("/app.js", served);
    respond(agent.handle(&get("/app.js")).await)
      .write
      .unwrap()
      .await
      .unwrap();

    network.set_offline(true);
    let result = respond(agent.handle(&get("/app.js")).await);
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.response.status, StatusCode::OK);
    assert_eq!(result.response.body.as_ref(), b"app code");
    assert_eq!(
      result.response.headers.get("content-type").unwrap(),
      "application/javascript"
    );
  }

  #[tokio::test]
  async fn test_offline_navigation_falls_back_to_root() {
    let (agent, _storage, network) = activated(&["/"]).await;
    network.set_offline(true);

    let result = respond(agent.handle(&navigate("/deep/unknown/route")).await);
    assert_eq!(result.source, CacheSource::ShellFallback);
    assert_eq!(result.response.body.as_ref(), b"seed /");
  }

  #[tokio::test]
  async fn test_offline_subresource_without_entry_is_503() {
    let (agent, _storage, network) = activated(&["/"]).await;
    network.set_offline(true);

    let result = respond(agent.handle(&get("/deep/unknown/route")).await);
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(result.response.status_text, "Service Unavailable");
    assert_eq!(result.response.body.as_ref(), b"Offline");
  }

  #[tokio::test]
  async fn test_offline_navigation_without_shell_is_503() {
    let (agent, storage, network) = activated(&["/manifest.json"]).await;
    assert_eq!(storage.entry_count("ham-prep-v1").unwrap(), 1);
    network.set_offline(true);

    let result = respond(agent.handle(&navigate("/goals")).await);
    assert_eq!(result.source, CacheSource::Offline);
  }

  #[test]
  fn test_settings_from_config() {
    let config = Config {
      origin: Some(ORIGIN.to_string()),
      ..Config::default()
    };
    let settings = AgentSettings::from_config(&config).unwrap();
    assert_eq!(settings.version, "ham-prep-v1");
    assert_eq!(settings.origin.as_str(), ORIGIN);
    assert!(settings.skip_waiting);
  }
}
