//! Registration of agent versions and the controller that handles requests.
//!
//! The registration installs new versions, swaps the controller once a
//! version activates, and publishes update events for the application shell.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentSettings, Interception};
use crate::cache::CacheStorage;
use crate::config::UpdatePolicy;
use crate::net::{Network, Request};

/// Notifications for the application shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
  /// A new version started installing while another one controls requests
  UpdateFound { version: String },
  /// A new version finished installing while another one controls requests
  Installed { version: String },
  /// A version failed to install and will not activate
  InstallFailed { version: String, error: String },
  /// A version took over request handling
  ControllerChange { version: String },
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
  /// The configured version is already controlling or waiting
  UpToDate,
  /// Installed and waiting for a skip-waiting signal
  Waiting(String),
  /// Installed and now controlling
  Activated(String),
}

type SharedAgent<S, N> = Arc<Agent<S, N>>;

pub struct Registration<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  policy: UpdatePolicy,
  controller: RwLock<Option<SharedAgent<S, N>>>,
  waiting: Mutex<Option<SharedAgent<S, N>>>,
  /// Serializes install/activate cycles
  operations: tokio::sync::Mutex<()>,
  events: broadcast::Sender<RegistrationEvent>,
}

impl<S: CacheStorage + 'static, N: Network + 'static> Registration<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, policy: UpdatePolicy) -> Self {
    let (events, _) = broadcast::channel(16);

    Self {
      storage,
      network,
      policy,
      controller: RwLock::new(None),
      waiting: Mutex::new(None),
      operations: tokio::sync::Mutex::new(()),
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
    self.events.subscribe()
  }

  /// The agent currently handling requests.
  pub fn controller(&self) -> Option<SharedAgent<S, N>> {
    self
      .controller
      .read()
      .ok()
      .and_then(|controller| controller.clone())
  }

  /// An installed version that has not activated yet.
  pub fn waiting(&self) -> Option<SharedAgent<S, N>> {
    self
      .waiting
      .lock()
      .ok()
      .and_then(|waiting| waiting.clone())
  }

  /// Put the store activated by an earlier run back in control.
  ///
  /// Returns the restored version, if any.
  pub fn restore(&self, settings: &AgentSettings) -> Result<Option<String>> {
    let Some(version) = self.storage.active_store()? else {
      return Ok(None);
    };
    if !self.storage.has_store(&version)? {
      warn!(version = %version, "Active store is missing, not restoring");
      return Ok(None);
    }

    let settings = AgentSettings {
      version: version.clone(),
      ..settings.clone()
    };
    let agent = Arc::new(Agent::restored(
      settings,
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    ));
    self.set_controller(agent)?;

    info!(version = %version, "Restored active version");
    Ok(Some(version))
  }

  /// Install `settings` as a new version and activate it when allowed.
  pub async fn register(&self, settings: AgentSettings) -> Result<SharedAgent<S, N>> {
    let _guard = self.operations.lock().await;
    self.install_version(settings, false).await
  }

  /// Bring the configured version into control when the process starts.
  ///
  /// The version activated by an earlier run is restored first and keeps
  /// serving if the install fails. A restored version never holds the
  /// configured one in waiting: once installed, it activates.
  pub async fn start(&self, settings: AgentSettings) -> Result<UpdateOutcome> {
    let _guard = self.operations.lock().await;

    self.restore(&settings)?;
    if self
      .controller()
      .is_some_and(|controller| controller.version() == settings.version)
    {
      return Ok(UpdateOutcome::UpToDate);
    }

    let agent = self.install_version(settings, true).await?;
    Ok(UpdateOutcome::Activated(agent.version().to_string()))
  }

  /// Register `settings` unless that version is already controlling or waiting.
  pub async fn update(&self, settings: AgentSettings) -> Result<UpdateOutcome> {
    let _guard = self.operations.lock().await;

    let current = [self.controller(), self.waiting()];
    if current
      .iter()
      .flatten()
      .any(|agent| agent.version() == settings.version)
    {
      return Ok(UpdateOutcome::UpToDate);
    }

    let agent = self.install_version(settings, false).await?;
    let version = agent.version().to_string();
    if self.is_controller(&agent) {
      Ok(UpdateOutcome::Activated(version))
    } else {
      Ok(UpdateOutcome::Waiting(version))
    }
  }

  /// Activate the waiting version now. Returns its version, if there was one.
  #[cfg_attr(not(unix), allow(dead_code))]
  pub async fn skip_waiting(&self) -> Result<Option<String>> {
    let _guard = self.operations.lock().await;

    let waiting = self
      .waiting
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .take();
    let Some(agent) = waiting else {
      return Ok(None);
    };

    self.promote(Arc::clone(&agent)).await?;
    Ok(Some(agent.version().to_string()))
  }

  /// Route a request to the controller. Without one, nothing is intercepted.
  pub async fn handle(&self, request: &Request) -> Option<Interception> {
    let controller = self.controller()?;
    Some(controller.handle(request).await)
  }

  /// With `claim`, the new version takes over as soon as it is installed.
  async fn install_version(
    &self,
    settings: AgentSettings,
    claim: bool,
  ) -> Result<SharedAgent<S, N>> {
    let agent = Arc::new(Agent::new(
      settings,
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    ));
    let version = agent.version().to_string();
    let has_controller = self.controller().is_some();
    watch_state(&agent);

    if has_controller {
      self.emit(RegistrationEvent::UpdateFound {
        version: version.clone(),
      });
    }

    if let Err(e) = agent.install().await {
      self.emit(RegistrationEvent::InstallFailed {
        version,
        error: e.to_string(),
      });
      return Err(e);
    }

    if has_controller {
      self.emit(RegistrationEvent::Installed {
        version: version.clone(),
      });
    }

    let activate_now =
      claim || !has_controller || agent.skip_waiting() || self.policy == UpdatePolicy::Reload;

    if activate_now {
      self.promote(Arc::clone(&agent)).await?;
    } else {
      let previous = self
        .waiting
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .replace(Arc::clone(&agent));
      if let Some(previous) = previous {
        previous.retire();
      }
      info!(version = %version, "Installed, waiting to activate");
    }

    Ok(agent)
  }

  /// Activate `agent` and hand it every subsequent request.
  async fn promote(&self, agent: SharedAgent<S, N>) -> Result<()> {
    agent.activate().await?;
    self.set_controller(Arc::clone(&agent))?;

    // Anything still waiting is older than what just took over
    let stale = self
      .waiting
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .take();
    if let Some(stale) = stale.filter(|w| !Arc::ptr_eq(w, &agent)) {
      stale.retire();
    }

    Ok(())
  }

  fn set_controller(&self, agent: SharedAgent<S, N>) -> Result<()> {
    let version = agent.version().to_string();
    let previous = self
      .controller
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .replace(agent);

    if let Some(previous) = previous {
      previous.retire();
    }

    self.emit(RegistrationEvent::ControllerChange { version });
    Ok(())
  }

  fn is_controller(&self, agent: &SharedAgent<S, N>) -> bool {
    self
      .controller()
      .is_some_and(|controller| Arc::ptr_eq(&controller, agent))
  }

  fn emit(&self, event: RegistrationEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

/// Log every state change of `agent` until it is dropped.
fn watch_state<S, N>(agent: &Agent<S, N>)
where
  S: CacheStorage + 'static,
  N: Network,
{
  let mut state = agent.subscribe();
  let version = agent.version().to_string();

  tokio::spawn(async move {
    while state.changed().await.is_ok() {
      let current = *state.borrow_and_update();
      debug!(version = %version, state = %current, "Worker state changed");
    }
  });
}

/// Check for a new version every `interval`.
///
/// `load` produces the settings to compare against; it typically re-reads the
/// configuration file. The first check happens one interval after spawning.
pub fn spawn_update_poller<S, N, F>(
  registration: Arc<Registration<S, N>>,
  interval: Duration,
  load: F,
) -> JoinHandle<()>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
  F: Fn() -> Result<AgentSettings> + Send + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
      ticker.tick().await;

      let settings = match load() {
        Ok(settings) => settings,
        Err(e) => {
          warn!(error = %e, "Update check skipped, could not load configuration");
          continue;
        }
      };

      match registration.update(settings).await {
        Ok(UpdateOutcome::UpToDate) => debug!("Update check: up to date"),
        Ok(outcome) => info!(?outcome, "Update check finished"),
        Err(e) => warn!(error = %e, "Update check failed"),
      }
    }
  })
}

/// Activate the waiting version whenever the process receives SIGUSR1.
#[cfg(unix)]
pub fn spawn_skip_waiting_listener<S, N>(
  registration: Arc<Registration<S, N>>,
) -> Result<JoinHandle<()>>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  use tokio::signal::unix::{signal, SignalKind};

  let mut signals = signal(SignalKind::user_defined1())
    .map_err(|e| eyre!("Failed to listen for SIGUSR1: {}", e))?;

  Ok(tokio::spawn(async move {
    while signals.recv().await.is_some() {
      match registration.skip_waiting().await {
        Ok(Some(version)) => info!(version = %version, "Skip-waiting signal activated version"),
        Ok(None) => debug!("Skip-waiting signal received, nothing is waiting"),
        Err(e) => warn!(error = %e, "Skip-waiting activation failed"),
      }
    }
  }))
}

/// Log registration events until the registration goes away.
pub fn spawn_event_logger(
  mut events: broadcast::Receiver<RegistrationEvent>,
  policy: UpdatePolicy,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      match events.recv().await {
        Ok(RegistrationEvent::UpdateFound { version }) => {
          info!(version = %version, "Update found, installing")
        }
        Ok(RegistrationEvent::Installed { version }) => match policy {
          UpdatePolicy::Log => info!(
            version = %version,
            "A new version is available and will take over on the next activation"
          ),
          UpdatePolicy::Reload => info!(version = %version, "A new version is available, activating"),
        },
        Ok(RegistrationEvent::InstallFailed { version, error }) => {
          warn!(version = %version, error = %error, "New version failed to install")
        }
        Ok(RegistrationEvent::ControllerChange { version }) => {
          info!(version = %version, "Now serving")
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          debug!(skipped, "Event logger lagged")
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  })
}
