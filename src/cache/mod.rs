//! Versioned response cache for offline support.
//!
//! This module provides:
//! - Named stores, one per deployed version, persisted in SQLite
//! - Request identities hashed into stable keys
//! - A network-first layer that writes 200 responses in the background and
//!   serves stored responses when the network is unavailable

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheKey, CacheResult, CacheSource, EntryKey};
