//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::net::Response;

/// Trait for anything that can address an entry in a named store.
///
/// Implementors provide a stable hash for lookups and a human readable
/// description that is kept alongside the entry for listing.
pub trait CacheKey {
  /// Stable, fixed-length key (hex digest)
  fn cache_hash(&self) -> String;

  /// Human readable form, e.g. "GET https://example.org/app.js"
  fn description(&self) -> String;

  /// Owned snapshot of this key, usable from detached tasks.
  fn entry_key(&self) -> EntryKey {
    EntryKey {
      hash: self.cache_hash(),
      description: self.description(),
    }
  }
}

/// Owned request identity as stored in the cache tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
  pub hash: String,
  pub description: String,
}

impl CacheKey for EntryKey {
  fn cache_hash(&self) -> String {
    self.hash.clone()
  }

  fn description(&self) -> String {
    self.description.clone()
  }

  fn entry_key(&self) -> EntryKey {
    self.clone()
  }
}

/// A response read back from a named store.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result of a network-first fetch, including where the response came from.
#[derive(Debug)]
pub struct CacheResult {
  /// The response handed back to the caller
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Detached cache write, if one was scheduled. Dropping it does not cancel the write.
  pub write: Option<JoinHandle<()>>,
}

impl CacheResult {
  /// Fresh response from the network.
  pub fn from_network(response: Response, write: Option<JoinHandle<()>>) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
      write,
    }
  }

  /// Network failed, exact entry found in the store.
  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Cache,
      cached_at: Some(entry.cached_at),
      write: None,
    }
  }

  /// Network failed, navigation answered with the app shell document.
  pub fn from_shell(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::ShellFallback,
      cached_at: Some(entry.cached_at),
      write: None,
    }
  }

  /// Network failed and nothing usable was cached.
  pub fn offline() -> Self {
    Self {
      response: Response::offline(),
      source: CacheSource::Offline,
      cached_at: None,
      write: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network unavailable, exact match served from the store
  Cache,
  /// Network unavailable, root document served for a navigation
  ShellFallback,
  /// Network unavailable and no cache entry, synthesized 503
  Offline,
}
