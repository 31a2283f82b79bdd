//! Core traits and types for the caching system.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Keys a repository can cache under.
///
/// `Display` gives the key's storage form (SQLite rows, log fields).
pub trait CacheKey: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

/// Values a repository can cache.
///
/// Equality is what suppresses duplicate emissions to observers.
pub trait CacheValue: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

/// Extra arguments forwarded to the fetch function.
pub trait FetchArgs: Clone + Send + Sync + 'static {}

impl<T> FetchArgs for T where T: Clone + Send + Sync + 'static {}

/// A stored value together with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
  pub data: V,
  /// Epoch milliseconds of the write. `0` marks the entry as always stale.
  pub store_time: i64,
}

impl<V> CacheEntry<V> {
  pub fn new(data: V, store_time: i64) -> Self {
    Self { data, store_time }
  }
}

/// Current wall clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}
