//! Cache layer that orchestrates the network-first strategy over one named store.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedEntry, EntryKey};
use crate::net::Response;

/// Cache layer bound to a single named store.
///
/// This layer sits between the proxy and the network, writing successful
/// responses into the store and falling back to it when the network fails.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  store: String,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(storage: Arc<S>, store: impl Into<String>) -> Self {
    Self {
      storage,
      store: store.into(),
    }
  }

  /// Fetch with a network-first strategy.
  ///
  /// 1. Fetch from network; any response is returned as-is
  /// 2. A 200 response is copied into the store by a detached task
  /// 3. On network failure, serve the stored entry for `key`
  /// 4. Otherwise serve the stored `shell` entry, if one was given
  /// 5. Otherwise synthesize a 503
  pub async fn network_first<F, Fut>(
    &self,
    key: EntryKey,
    shell: Option<EntryKey>,
    fetcher: F,
  ) -> CacheResult
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        let write = response
          .is_cacheable()
          .then(|| self.spawn_write(key, response.clone()));
        CacheResult::from_network(response, write)
      }
      Err(e) => {
        debug!(request = %key.description, error = %e, "Network failed, consulting cache");

        if let Some(entry) = self.lookup(&key) {
          return CacheResult::from_cache(entry);
        }

        if let Some(entry) = shell.as_ref().and_then(|shell| self.lookup(shell)) {
          return CacheResult::from_shell(entry);
        }

        CacheResult::offline()
      }
    }
  }

  /// Write a response without making the caller wait for it.
  fn spawn_write(&self, key: EntryKey, response: Response) -> tokio::task::JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let store = self.store.clone();

    tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put_entry(&store, &key, &response) {
        warn!(store = %store, request = %key.description, error = %e, "Cache write failed");
      }
    })
  }

  /// Read failures count as a miss.
  fn lookup(&self, key: &EntryKey) -> Option<CachedEntry> {
    match self.storage.match_entry(&self.store, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(store = %self.store, request = %key.description, error = %e, "Cache read failed");
        None
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      store: self.store.clone(),
    }
  }
}
