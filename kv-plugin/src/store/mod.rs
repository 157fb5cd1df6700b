//! Backing stores for the KV service
//!
//! The protocol core treats the store as a black box: it only registers the
//! KV service that wraps one. Failures stay inside the call that caused them.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

/// Key/value operations exposed by the application service
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Build the store selected by configuration
pub fn from_config(config: &StoreConfig) -> Arc<dyn KvStore> {
    match config.backend {
        StoreBackend::File => {
            tracing::info!(dir = %config.dir.display(), "using file store");
            Arc::new(FileStore::new(config.dir.clone()))
        }
        StoreBackend::Memory => {
            tracing::info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
    }
}
