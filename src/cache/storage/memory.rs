//! In-process storage backed by named boxes.
//!
//! A named box is shared by every `MemoryStorage` opened with the same name in
//! this process. Boxes are created on first access and only torn down by
//! `clear_all_boxes`.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use indexmap::IndexMap;
use once_cell::sync::{Lazy, OnceCell};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::CacheStorage;
use crate::cache::channel::{ReplayChannel, Subscription};
use crate::cache::lock::mutex_lock;
use crate::cache::traits::{now_millis, CacheEntry, CacheKey, CacheValue};

/// Process-wide registry of named boxes.
static BOXES: Lazy<Mutex<HashMap<String, Arc<dyn ErasedBox>>>> =
  Lazy::new(|| Mutex::new(HashMap::new()));

/// Type-erased view of a box, so boxes of any key/value type share one registry.
trait ErasedBox: Send + Sync {
  fn reset(&self);
  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct MemoryBox<K, V> {
  /// Insertion-ordered so the change feed lists values deterministically
  entries: Mutex<IndexMap<K, CacheEntry<V>>>,
  feed: ReplayChannel<Vec<V>>,
}

impl<K: CacheKey, V: CacheValue> MemoryBox<K, V> {
  fn new() -> Self {
    Self {
      entries: Mutex::new(IndexMap::new()),
      feed: ReplayChannel::with_value(Vec::new()),
    }
  }

  /// Publish the current value list. Called with the entries lock held so
  /// feed order matches mutation order.
  fn publish(&self, entries: &IndexMap<K, CacheEntry<V>>) {
    self
      .feed
      .publish(entries.values().map(|entry| entry.data.clone()).collect());
  }
}

impl<K: CacheKey, V: CacheValue> ErasedBox for MemoryBox<K, V> {
  fn reset(&self) {
    let mut entries = mutex_lock(&self.entries, "memory.reset");
    entries.clear();
    self.publish(&entries);
  }

  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}

fn open_box<K: CacheKey, V: CacheValue>(name: &str) -> Result<Arc<MemoryBox<K, V>>> {
  let mut boxes = mutex_lock(&BOXES, "memory.open_box");
  let erased = boxes
    .entry(name.to_string())
    .or_insert_with(|| {
      debug!(box_name = name, "Creating memory box");
      Arc::new(MemoryBox::<K, V>::new()) as Arc<dyn ErasedBox>
    })
    .clone();

  erased
    .into_any()
    .downcast::<MemoryBox<K, V>>()
    .map_err(|_| eyre!("Memory box '{}' holds a different key or value type", name))
}

/// Empty and forget every named box in the process.
///
/// Storages that already opened a box keep using it (now empty); storages
/// opened afterwards start from fresh boxes.
pub fn clear_all_boxes() {
  let mut boxes = mutex_lock(&BOXES, "memory.clear_all_boxes");
  for store in boxes.values() {
    store.reset();
  }
  boxes.clear();
}

/// In-memory cache storage.
pub struct MemoryStorage<K, V> {
  /// `None` for detached boxes that never enter the registry
  name: Option<String>,
  store: OnceCell<Arc<MemoryBox<K, V>>>,
}

impl<K: CacheKey, V: CacheValue> MemoryStorage<K, V> {
  /// Storage on the process-wide box `name`, created on first use.
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: Some(name.into()),
      store: OnceCell::new(),
    }
  }

  /// Storage on a private box nobody else can open.
  pub fn detached() -> Self {
    Self {
      name: None,
      store: OnceCell::with_value(Arc::new(MemoryBox::new())),
    }
  }

  fn store(&self) -> Result<&Arc<MemoryBox<K, V>>> {
    self.store.get_or_try_init(|| match &self.name {
      Some(name) => open_box(name),
      None => Ok(Arc::new(MemoryBox::new())),
    })
  }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> CacheStorage<K, V> for MemoryStorage<K, V> {
  async fn ensure_initialized(&self) -> Result<()> {
    self.store().map(|_| ())
  }

  async fn get(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    let store = self.store()?;
    let entries = mutex_lock(&store.entries, "memory.get");
    Ok(entries.get(key).cloned())
  }

  async fn put(&self, key: &K, value: V, store_time: Option<i64>) -> Result<()> {
    let store = self.store()?;
    let mut entries = mutex_lock(&store.entries, "memory.put");
    let entry = CacheEntry::new(value, store_time.unwrap_or_else(now_millis));
    entries.insert(key.clone(), entry);
    store.publish(&entries);
    Ok(())
  }

  async fn delete(&self, key: &K) -> Result<()> {
    let store = self.store()?;
    let mut entries = mutex_lock(&store.entries, "memory.delete");
    entries.shift_remove(key);
    store.publish(&entries);
    Ok(())
  }

  async fn clear(&self) -> Result<()> {
    let store = self.store()?;
    let mut entries = mutex_lock(&store.entries, "memory.clear");
    entries.clear();
    store.publish(&entries);
    Ok(())
  }

  async fn watch(&self) -> Result<Subscription<Vec<V>>> {
    Ok(self.store()?.feed.subscribe())
  }

  async fn get_all(&self) -> Result<Vec<V>> {
    let store = self.store()?;
    let entries = mutex_lock(&store.entries, "memory.get_all");
    Ok(entries.values().map(|entry| entry.data.clone()).collect())
  }
}
