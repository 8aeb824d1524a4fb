//! Worker lifecycle states and the transitions allowed between them.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use tokio::sync::watch;

/// Lifecycle state of one agent version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, install not started
  #[default]
  Parsed,
  /// Seeding the store
  Installing,
  /// Seeded, waiting to activate
  Installed,
  /// Cleaning up old stores
  Activating,
  /// Handling requests
  Activated,
  /// Failed or superseded
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Check if a state transition is valid
pub fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
  use WorkerState::*;

  matches!(
    (from, to),
    (Parsed, Installing)
      | (Installing, Installed)
      | (Installing, Redundant) // install failed
      | (Installed, Activating)
      | (Installed, Redundant) // replaced while waiting
      | (Activating, Activated)
      | (Activating, Redundant)
      | (Activated, Redundant) // superseded
  )
}

/// Current state plus a change signal observers can subscribe to.
pub struct Lifecycle {
  state: watch::Sender<WorkerState>,
}

impl Lifecycle {
  pub fn new(initial: WorkerState) -> Self {
    let (state, _) = watch::channel(initial);
    Self { state }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Receiver that sees every state change.
  pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
    self.state.subscribe()
  }

  /// Move to `to`, rejecting transitions the lifecycle does not allow.
  pub fn transition(&self, to: WorkerState) -> Result<WorkerState> {
    let mut from = WorkerState::default();
    let mut valid = false;

    self.state.send_if_modified(|state| {
      from = *state;
      valid = is_valid_transition(from, to);
      if valid {
        *state = to;
      }
      valid
    });

    if valid {
      Ok(from)
    } else {
      Err(eyre!("Invalid worker state transition: {} -> {}", from, to))
    }
  }
}
