//! Memory storage whose reads or writes can be switched to fail.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{CacheStorage, MemoryStorage};
use crate::cache::channel::Subscription;
use crate::cache::traits::{CacheEntry, CacheKey, CacheValue};

pub(crate) struct FailingStorage<K, V> {
  inner: MemoryStorage<K, V>,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> FailingStorage<K, V> {
  pub(crate) fn new() -> Self {
    Self {
      inner: MemoryStorage::detached(),
      fail_reads: AtomicBool::new(false),
      fail_writes: AtomicBool::new(false),
    }
  }

  /// Make `get` and `get_all` fail.
  pub(crate) fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  /// Make `put`, `delete` and `clear` fail.
  pub(crate) fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  fn check(flag: &AtomicBool, op: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
      return Err(eyre!("Storage {} failed", op));
    }
    Ok(())
  }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> CacheStorage<K, V> for FailingStorage<K, V> {
  async fn ensure_initialized(&self) -> Result<()> {
    self.inner.ensure_initialized().await
  }

  async fn get(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    Self::check(&self.fail_reads, "read")?;
    self.inner.get(key).await
  }

  async fn put(&self, key: &K, value: V, store_time: Option<i64>) -> Result<()> {
    Self::check(&self.fail_writes, "write")?;
    self.inner.put(key, value, store_time).await
  }

  async fn delete(&self, key: &K) -> Result<()> {
    Self::check(&self.fail_writes, "write")?;
    self.inner.delete(key).await
  }

  async fn clear(&self) -> Result<()> {
    Self::check(&self.fail_writes, "write")?;
    self.inner.clear().await
  }

  async fn watch(&self) -> Result<Subscription<Vec<V>>> {
    self.inner.watch().await
  }

  async fn get_all(&self) -> Result<Vec<V>> {
    Self::check(&self.fail_reads, "read")?;
    self.inner.get_all().await
  }
}
