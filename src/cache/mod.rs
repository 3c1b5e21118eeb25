//! Persistent response cache keyed by full request URL.
//!
//! This module provides the store the retrieval engine reads from and writes
//! to:
//! - One named store per configuration (default `images-proxy-v1`)
//! - Last write for a key wins, entries never expire
//! - SQLite for durability across restarts, plus in-memory and no-op backends

mod storage;
mod types;

pub use storage::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use types::{CachedResponse, StoredResponse};

use color_eyre::Result;
use std::sync::Arc;

use crate::config::{CacheBackend, CacheConfig};

/// Build the store selected by the configuration. SQLite stores are not
/// opened until first use.
pub fn from_config(config: &CacheConfig) -> Result<Arc<dyn CacheStorage>> {
  let storage: Arc<dyn CacheStorage> = match config.backend {
    CacheBackend::Sqlite => {
      let storage = match &config.path {
        Some(path) => SqliteStorage::new(path, &config.name),
        None => SqliteStorage::at_default_path(&config.name)?,
      };
      tracing::debug!(path = %storage.path().display(), name = %config.name, "using sqlite cache");
      Arc::new(storage)
    }
    CacheBackend::Memory => Arc::new(MemoryStorage::new()),
    CacheBackend::None => Arc::new(NoopStorage),
  };
  Ok(storage)
}
