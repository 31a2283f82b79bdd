//! Policies injected into a repository at construction.

use chrono::Duration;
use std::sync::Arc;

/// Computes how long a specific entry stays fresh.
///
/// Evaluated on every read, so the TTL can depend on the value itself
/// (e.g. a shorter TTL for records that often fail to load).
pub type CacheDurationResolver<K, V> = Arc<dyn Fn(&K, &V) -> Duration + Send + Sync>;

/// Resolver returning the same TTL for every entry.
pub fn fixed_duration<K, V>(duration: Duration) -> CacheDurationResolver<K, V> {
  Arc::new(move |_, _| duration)
}

/// Default TTL for repositories backed by a fetch function.
pub fn default_cache_duration() -> Duration {
  Duration::minutes(5)
}

/// What a reload queued during an in-flight fetch passes to the fetch function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadArgsPolicy {
  /// Queued reloads fetch without arguments; they only refresh the cache.
  #[default]
  Drop,
  /// Queued reloads reuse the arguments of the load that queued them.
  Reuse,
}

/// How `Repository::clear(None)` treats live coordinators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BulkClearPolicy {
  /// Close every coordinator so its subscribers see the channel end.
  #[default]
  CloseAndDrop,
  /// Forget coordinators without closing them; their channels never complete.
  DropOnly,
}
