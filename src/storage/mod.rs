//! Persistent key-value storage.
//!
//! The host platform supplies the real backend through [`KeyValueStore`].
//! Two adapters ship with the crate: [`MemoryStore`] for tests and ephemeral
//! sessions, and [`FileStore`] for desktop hosts.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;

/// Abstract persistent get/set/remove of opaque blobs keyed by string.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the blob stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// Once this returns `Ok` the value is considered durable.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
