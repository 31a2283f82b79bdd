//! Storage contract consumed by key coordinators, and the bundled backends.

#[cfg(test)]
pub(crate) mod failing;
mod memory;
mod sqlite;

use async_trait::async_trait;
use color_eyre::Result;

use super::channel::Subscription;
use super::traits::CacheEntry;

pub use memory::{clear_all_boxes, MemoryStorage};
pub use sqlite::SqliteStorage;

/// Trait for cache storage backends.
///
/// One storage instance is shared by every coordinator of a repository, so
/// implementations must tolerate concurrent access to different keys.
#[async_trait]
pub trait CacheStorage<K, V>: Send + Sync {
  /// Idempotent setup. Called before operations that may run outside a
  /// coordinator's critical section.
  async fn ensure_initialized(&self) -> Result<()>;

  /// Get the entry stored under `key`.
  async fn get(&self, key: &K) -> Result<Option<CacheEntry<V>>>;

  /// Store `value` under `key`. `store_time` defaults to now.
  async fn put(&self, key: &K, value: V, store_time: Option<i64>) -> Result<()>;

  async fn delete(&self, key: &K) -> Result<()>;

  /// Remove all entries.
  async fn clear(&self) -> Result<()>;

  /// Feed of the full value list, re-emitted after every `put`, `delete` and
  /// `clear`, even when the list is unchanged.
  async fn watch(&self) -> Result<Subscription<Vec<V>>>;

  async fn get_all(&self) -> Result<Vec<V>>;
}
