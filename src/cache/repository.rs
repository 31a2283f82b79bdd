//! Keyed registry of load coordinators.
//!
//! A `Repository` hands out one `KeyCoordinator` per key, creating it on first
//! use under a registry-wide mutex, and exposes operations spanning all keys.

use chrono::Duration;
use color_eyre::Result;
use futures::future::{join_all, FutureExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::channel::Subscription;
use super::coordinator::{FetchFn, KeyCoordinator, LoadContext, LoadRequest, SideEffect};
use super::error::ResourceClosed;
use super::lock::mutex_lock;
use super::policy::{
  default_cache_duration, fixed_duration, BulkClearPolicy, CacheDurationResolver,
  ReloadArgsPolicy,
};
use super::resource::Resource;
use super::storage::{CacheStorage, MemoryStorage};
use super::traits::{CacheKey, CacheValue, FetchArgs};

/// Options for `Repository::observe` and `Repository::await_one`.
pub struct ObserveOptions<V, A = ()> {
  /// `None` forces a reload only the first time the key is observed
  pub force_reload: Option<bool>,
  pub side_effect: Option<SideEffect<V>>,
  pub fetch_args: Option<A>,
  pub allow_empty_loading: bool,
}

impl<V, A> ObserveOptions<V, A> {
  pub fn new() -> Self {
    Self {
      force_reload: None,
      side_effect: None,
      fetch_args: None,
      allow_empty_loading: false,
    }
  }

  pub fn force_reload(mut self, force: bool) -> Self {
    self.force_reload = Some(force);
    self
  }

  pub fn side_effect(mut self, side_effect: impl Fn(&V) + Send + Sync + 'static) -> Self {
    self.side_effect = Some(Arc::new(side_effect));
    self
  }

  pub fn fetch_args(mut self, args: A) -> Self {
    self.fetch_args = Some(args);
    self
  }

  pub fn allow_empty_loading(mut self, allow: bool) -> Self {
    self.allow_empty_loading = allow;
    self
  }
}

impl<V, A> Default for ObserveOptions<V, A> {
  fn default() -> Self {
    Self::new()
  }
}

/// Per-key cache with coalesced refresh and reactive notifications.
pub struct Repository<K, V, A = ()> {
  coordinators: tokio::sync::Mutex<HashMap<K, Arc<KeyCoordinator<K, V, A>>>>,
  /// Keys observed at least once; unobserved keys force a reload on first observe
  observed: Mutex<HashSet<K>>,
  context: Arc<LoadContext<K, V, A>>,
  bulk_clear: BulkClearPolicy,
}

impl<K: CacheKey, V: CacheValue, A: FetchArgs> Repository<K, V, A> {
  /// Start building a repository that loads missing or stale values with `fetch`.
  pub fn remote<F, Fut>(fetch: F) -> RepositoryBuilder<K, V, A>
  where
    F: Fn(K, Option<A>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let fetcher: FetchFn<K, V, A> =
      Arc::new(move |key: K, args: Option<A>| fetch(key, args).boxed());
    RepositoryBuilder {
      storage: None,
      fetcher: Some(fetcher),
      cache_duration: None,
      reload_args: ReloadArgsPolicy::default(),
      bulk_clear: BulkClearPolicy::default(),
    }
  }

  /// Repository whose storage is the only source of truth.
  pub fn local(storage: impl CacheStorage<K, V> + 'static) -> Self {
    Self::local_shared(Arc::new(storage))
  }

  /// Local-mode repository on an already shared storage backend.
  pub fn local_shared(storage: Arc<dyn CacheStorage<K, V>>) -> Self {
    RepositoryBuilder {
      storage: Some(storage),
      fetcher: None,
      cache_duration: Some(fixed_duration(Duration::zero())),
      reload_args: ReloadArgsPolicy::default(),
      bulk_clear: BulkClearPolicy::default(),
    }
    .build()
  }

  /// Whether this repository has a fetch function.
  pub fn is_remote(&self) -> bool {
    self.context.fetcher.is_some()
  }

  /// Return the coordinator for `key`, creating it if needed.
  ///
  /// A coordinator closed directly by its holder is replaced, never handed out again.
  pub async fn resolve(&self, key: &K) -> Arc<KeyCoordinator<K, V, A>> {
    let mut coordinators = self.coordinators.lock().await;
    if let Some(existing) = coordinators.get(key) {
      if !existing.is_closed() {
        return Arc::clone(existing);
      }
    }

    debug!(key = %key, "Creating key coordinator");
    let coordinator = Arc::new(KeyCoordinator::new(key.clone(), Arc::clone(&self.context)));
    coordinators.insert(key.clone(), Arc::clone(&coordinator));
    coordinator
  }

  /// The live coordinator for `key`, if any. A closed one is unregistered.
  async fn existing(&self, key: &K) -> Option<Arc<KeyCoordinator<K, V, A>>> {
    let mut coordinators = self.coordinators.lock().await;
    let coordinator = coordinators.get(key).cloned()?;
    if coordinator.is_closed() {
      coordinators.remove(key);
      return None;
    }
    Some(coordinator)
  }

  /// Every live coordinator, unregistering the closed ones.
  async fn live(&self) -> Vec<Arc<KeyCoordinator<K, V, A>>> {
    let mut coordinators = self.coordinators.lock().await;
    coordinators.retain(|_, coordinator| !coordinator.is_closed());
    coordinators.values().cloned().collect()
  }

  /// Observe `key`, loading it as needed.
  ///
  /// Without an explicit `force_reload`, the first observation of a key
  /// forces a reload and later ones only reload stale entries.
  pub async fn observe(
    &self,
    key: &K,
    options: ObserveOptions<V, A>,
  ) -> Result<Subscription<Resource<V>>> {
    let first_observation = mutex_lock(&self.observed, "repository.observed").insert(key.clone());
    let force_reload = options.force_reload.unwrap_or(first_observation);

    let coordinator = self.resolve(key).await;
    coordinator.load(LoadRequest {
      force_reload,
      side_effect: options.side_effect,
      fetch_args: options.fetch_args,
      allow_empty_loading: options.allow_empty_loading,
    })
  }

  /// Observe `key` and wait for the first state that is not `Loading`.
  pub async fn await_one(&self, key: &K, options: ObserveOptions<V, A>) -> Result<Resource<V>> {
    let mut states = self.observe(key, options).await?;
    states
      .next_settled()
      .await
      .ok_or_else(|| ResourceClosed::new(key.to_string()).into())
  }

  /// Mark `key` stale and reload it. No-op if the key has no live coordinator.
  pub async fn invalidate(&self, key: &K) -> Result<()> {
    match self.existing(key).await {
      Some(coordinator) => coordinator.invalidate().await,
      None => Ok(()),
    }
  }

  /// Invalidate every key that has a live coordinator.
  ///
  /// All keys are invalidated even if some fail; the first failure is returned.
  pub async fn invalidate_all(&self) -> Result<()> {
    let coordinators = self.live().await;
    join_all(
      coordinators
        .iter()
        .map(|coordinator| coordinator.invalidate()),
    )
    .await
    .into_iter()
    .collect::<Result<Vec<()>>>()?;
    Ok(())
  }

  /// Replace the value of `key` with `transform(current)`.
  pub async fn update_value<F>(&self, key: &K, transform: F, notify_on_null: bool) -> Result<()>
  where
    F: FnOnce(Option<V>) -> Option<V> + Send,
  {
    self
      .resolve(key)
      .await
      .update_value(transform, notify_on_null)
      .await
  }

  /// Store `value` under `key` as fresh data.
  pub async fn put_value(&self, key: &K, value: V) -> Result<()> {
    self.resolve(key).await.put_value(value).await
  }

  /// Feed of all stored values, re-emitted on every change.
  pub async fn watch_all(&self) -> Result<Subscription<Vec<V>>> {
    self.context.storage.watch().await
  }

  pub async fn get_all(&self) -> Result<Vec<V>> {
    self.context.storage.get_all().await
  }

  /// Remove `key`, or everything when `key` is `None`.
  pub async fn clear(&self, key: Option<&K>) -> Result<()> {
    let mut coordinators = self.coordinators.lock().await;

    match key {
      Some(key) => match coordinators.get(key).cloned() {
        Some(coordinator) if !coordinator.is_closed() => {
          // Unregistered only once closing succeeds
          coordinator.close().await?;
          coordinators.remove(key);
          Ok(())
        }
        _ => {
          coordinators.remove(key);
          self.context.storage.ensure_initialized().await?;
          self.context.storage.delete(key).await
        }
      },
      None => {
        let dropped: Vec<_> = coordinators.drain().map(|(_, c)| c).collect();
        if self.bulk_clear == BulkClearPolicy::CloseAndDrop {
          for coordinator in dropped.iter().filter(|c| !c.is_closed()) {
            coordinator.close().await?;
          }
        }
        info!(
          coordinators = dropped.len(),
          policy = ?self.bulk_clear,
          "Clearing cache repository"
        );
        self.context.storage.clear().await
      }
    }
  }
}

/// Builder for remote-mode repositories.
pub struct RepositoryBuilder<K, V, A = ()> {
  storage: Option<Arc<dyn CacheStorage<K, V>>>,
  fetcher: Option<FetchFn<K, V, A>>,
  cache_duration: Option<CacheDurationResolver<K, V>>,
  reload_args: ReloadArgsPolicy,
  bulk_clear: BulkClearPolicy,
}

impl<K: CacheKey, V: CacheValue, A: FetchArgs> RepositoryBuilder<K, V, A> {
  /// Storage backend. Defaults to a detached in-memory box.
  pub fn storage(mut self, storage: impl CacheStorage<K, V> + 'static) -> Self {
    self.storage = Some(Arc::new(storage));
    self
  }

  /// Use an already shared storage backend.
  pub fn shared_storage(mut self, storage: Arc<dyn CacheStorage<K, V>>) -> Self {
    self.storage = Some(storage);
    self
  }

  /// Same TTL for every entry. Defaults to five minutes.
  pub fn cache_duration(mut self, duration: Duration) -> Self {
    self.cache_duration = Some(fixed_duration(duration));
    self
  }

  /// TTL computed per entry from its key and value.
  pub fn cache_duration_resolver(
    mut self,
    resolver: impl Fn(&K, &V) -> Duration + Send + Sync + 'static,
  ) -> Self {
    self.cache_duration = Some(Arc::new(resolver));
    self
  }

  pub fn queued_reload_args(mut self, policy: ReloadArgsPolicy) -> Self {
    self.reload_args = policy;
    self
  }

  pub fn bulk_clear(mut self, policy: BulkClearPolicy) -> Self {
    self.bulk_clear = policy;
    self
  }

  pub fn build(self) -> Repository<K, V, A> {
    let storage = self
      .storage
      .unwrap_or_else(|| Arc::new(MemoryStorage::<K, V>::detached()) as Arc<dyn CacheStorage<K, V>>);
    let cache_duration = self
      .cache_duration
      .unwrap_or_else(|| fixed_duration(default_cache_duration()));

    Repository {
      coordinators: tokio::sync::Mutex::new(HashMap::new()),
      observed: Mutex::new(HashSet::new()),
      context: Arc::new(LoadContext {
        storage,
        fetcher: self.fetcher,
        cache_duration,
        reload_args: self.reload_args,
      }),
      bulk_clear: self.bulk_clear,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::error::is_closed_error;
  use crate::cache::storage::failing::FailingStorage;
  use crate::cache::traits::now_millis;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::sync::Notify;

  type Repo = Repository<String, u32>;

  fn key(name: &str) -> String {
    name.to_string()
  }

  /// Remote repository whose fetch returns 100 + number of calls so far.
  fn counting_repo(calls: Arc<AtomicU32>) -> Repo {
    Repository::remote(move |_: String, _: Option<()>| {
      let calls = calls.clone();
      async move { Ok(100 + calls.fetch_add(1, Ordering::SeqCst)) }
    })
    .build()
  }

  async fn wait_idle(repo: &Repo, name: &str) {
    let coordinator = repo.resolve(&key(name)).await;
    while coordinator.is_loading() {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test]
  async fn test_first_observe_forces_reload() {
    let calls = Arc::new(AtomicU32::new(0));
    let repo = counting_repo(calls.clone());
    repo.put_value(&key("a"), 1).await.unwrap();

    // Fresh entry, but never observed before: forced
    let first = repo.await_one(&key("a"), ObserveOptions::new()).await.unwrap();
    assert_eq!(first, Resource::success(Some(100)));
    wait_idle(&repo, "a").await;

    // Second observation without a flag: served from cache
    let second = repo.await_one(&key("a"), ObserveOptions::new()).await.unwrap();
    assert_eq!(second, Resource::success(Some(100)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    wait_idle(&repo, "a").await;
    let forced = repo
      .await_one(&key("a"), ObserveOptions::new().force_reload(true))
      .await
      .unwrap();
    assert_eq!(forced, Resource::success(Some(101)));
  }

  #[tokio::test]
  async fn test_explicit_flag_overrides_first_observation() {
    let calls = Arc::new(AtomicU32::new(0));
    let repo = counting_repo(calls.clone());
    repo.put_value(&key("a"), 1).await.unwrap();

    let state = repo
      .await_one(&key("a"), ObserveOptions::new().force_reload(false))
      .await
      .unwrap();
    assert_eq!(state, Resource::success(Some(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_put_then_await_in_local_mode() {
    let repo: Repo = Repository::local(MemoryStorage::detached());
    repo.put_value(&key("k"), 5).await.unwrap();

    let state = repo.await_one(&key("k"), ObserveOptions::new()).await.unwrap();
    assert_eq!(state, Resource::success(Some(5)));
    assert!(!repo.is_remote());
  }

  #[tokio::test]
  async fn test_local_mode_missing_key() {
    let repo: Repo = Repository::local(MemoryStorage::detached());
    let state = repo.await_one(&key("k"), ObserveOptions::new()).await.unwrap();
    assert_eq!(state, Resource::success(None));
  }

  #[tokio::test]
  async fn test_put_value_round_trips_through_storage() {
    let storage = Arc::new(MemoryStorage::<String, u32>::detached());
    let repo: Repo = Repository::remote(|_: String, _: Option<()>| async { Ok(0) })
      .shared_storage(storage.clone())
      .build();

    let before = now_millis();
    repo.put_value(&key("k"), 42).await.unwrap();

    let entry = storage.get(&key("k")).await.unwrap().unwrap();
    assert_eq!(entry.data, 42);
    assert!(entry.store_time >= before && entry.store_time - before < 1_000);
  }

  #[tokio::test]
  async fn test_concurrent_forced_observes_fetch_once_more() {
    let calls = Arc::new(AtomicU32::new(0));
    let in_flight = Arc::new(AtomicU32::new(0));
    let max_in_flight = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(Notify::new());

    let repo: Repo = {
      let (calls, in_flight, max_in_flight, gate) = (
        calls.clone(),
        in_flight.clone(),
        max_in_flight.clone(),
        gate.clone(),
      );
      Repository::remote(move |_: String, _: Option<()>| {
        let (calls, in_flight, max_in_flight, gate) = (
          calls.clone(),
          in_flight.clone(),
          max_in_flight.clone(),
          gate.clone(),
        );
        async move {
          let call = calls.fetch_add(1, Ordering::SeqCst);
          let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
          max_in_flight.fetch_max(running, Ordering::SeqCst);
          gate.notified().await;
          in_flight.fetch_sub(1, Ordering::SeqCst);
          Ok(call)
        }
      })
      .build()
    };

    let mut states = repo
      .observe(&key("k"), ObserveOptions::new().force_reload(true))
      .await
      .unwrap();
    while calls.load(Ordering::SeqCst) == 0 {
      tokio::task::yield_now().await;
    }

    for _ in 0..5 {
      repo
        .observe(&key("k"), ObserveOptions::new().force_reload(true))
        .await
        .unwrap();
    }

    gate.notify_one();
    assert_eq!(states.next_settled().await, Some(Resource::success(Some(0))));
    while calls.load(Ordering::SeqCst) < 2 {
      tokio::task::yield_now().await;
    }
    gate.notify_one();
    assert_eq!(states.next_settled().await, Some(Resource::success(Some(1))));

    wait_idle(&repo, "k").await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidate_with_failing_fetch_keeps_value() {
    let storage = Arc::new(MemoryStorage::<String, u32>::detached());
    let repo: Repo = Repository::remote(|key: String, _: Option<()>| async move {
      Err(eyre!("cannot reach origin for {}", key))
    })
    .shared_storage(storage.clone())
    .build();

    repo.put_value(&key("k"), 8).await.unwrap();
    repo.invalidate(&key("k")).await.unwrap();

    let coordinator = repo.resolve(&key("k")).await;
    let state = coordinator.current().unwrap();
    assert!(state.is_error());
    assert_eq!(state.data(), Some(&8));

    let entry = storage.get(&key("k")).await.unwrap().unwrap();
    assert_eq!((entry.data, entry.store_time), (8, 0));
  }

  #[tokio::test]
  async fn test_invalidate_unknown_key_is_noop() {
    let repo: Repo = Repository::local(MemoryStorage::detached());
    repo.invalidate(&key("missing")).await.unwrap();
    repo.invalidate_all().await.unwrap();
  }

  #[tokio::test]
  async fn test_invalidate_skips_closed_coordinator() {
    let calls = Arc::new(AtomicU32::new(0));
    let repo = counting_repo(calls.clone());
    repo.put_value(&key("a"), 1).await.unwrap();
    repo.put_value(&key("b"), 2).await.unwrap();
    repo.resolve(&key("a")).await.close().await.unwrap();

    repo.invalidate(&key("a")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    repo.invalidate_all().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(repo.get_all().await.unwrap(), vec![100]);
  }

  #[tokio::test]
  async fn test_invalidate_all_refreshes_every_key() {
    let calls = Arc::new(AtomicU32::new(0));
    let repo = counting_repo(calls.clone());
    repo.put_value(&key("a"), 1).await.unwrap();
    repo.put_value(&key("b"), 2).await.unwrap();

    repo.invalidate_all().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let mut values = repo.get_all().await.unwrap();
    values.sort();
    assert_eq!(values, vec![100, 101]);
  }

  #[tokio::test]
  async fn test_update_to_none_deletes() {
    let storage = Arc::new(MemoryStorage::<String, u32>::detached());
    let repo: Repo = Repository::remote(|_: String, _: Option<()>| async { Ok(0) })
      .shared_storage(storage.clone())
      .build();
    repo.put_value(&key("quiet"), 1).await.unwrap();
    repo.put_value(&key("loud"), 2).await.unwrap();

    let quiet = repo.resolve(&key("quiet")).await;
    repo.update_value(&key("quiet"), |_| None, false).await.unwrap();
    assert!(storage.get(&key("quiet")).await.unwrap().is_none());
    assert_eq!(quiet.current(), Some(Resource::success(Some(1))));

    let loud = repo.resolve(&key("loud")).await;
    repo.update_value(&key("loud"), |_| None, true).await.unwrap();
    assert!(storage.get(&key("loud")).await.unwrap().is_none());
    assert_eq!(loud.current(), Some(Resource::success(None)));
  }

  #[tokio::test]
  async fn test_watch_all_local_scenario() {
    let repo: Repo = Repository::local(MemoryStorage::detached());
    let mut feed = repo.watch_all().await.unwrap();

    repo.put_value(&key("a"), 1).await.unwrap();
    repo.put_value(&key("b"), 2).await.unwrap();
    repo.clear(Some(&key("a"))).await.unwrap();
    repo
      .update_value(&key("b"), |_| Some(3), false)
      .await
      .unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
      seen.push(feed.recv().await.unwrap());
    }
    assert_eq!(seen, vec![vec![], vec![1], vec![1, 2], vec![2], vec![3]]);
  }

  #[tokio::test]
  async fn test_clear_key_without_coordinator() {
    let storage = Arc::new(MemoryStorage::<String, u32>::detached());
    storage.put(&key("orphan"), 1, None).await.unwrap();
    let repo: Repo = Repository::remote(|_: String, _: Option<()>| async { Ok(0) })
      .shared_storage(storage.clone())
      .build();

    repo.clear(Some(&key("orphan"))).await.unwrap();
    assert!(storage.get(&key("orphan")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_clear_key_closes_coordinator() {
    let repo: Repo = Repository::local(MemoryStorage::detached());
    repo.put_value(&key("a"), 1).await.unwrap();
    let old = repo.resolve(&key("a")).await;

    repo.clear(Some(&key("a"))).await.unwrap();
    assert!(old.is_closed());
    assert!(is_closed_error(&old.put_value(2).await.unwrap_err()));

    // A new coordinator replaces the closed one
    let fresh = repo.resolve(&key("a")).await;
    assert!(!Arc::ptr_eq(&old, &fresh));
    repo.put_value(&key("a"), 3).await.unwrap();
    assert_eq!(repo.get_all().await.unwrap(), vec![3]);
  }

  #[tokio::test]
  async fn test_failed_clear_keeps_coordinator_registered() {
    let storage = Arc::new(FailingStorage::<String, u32>::new());
    let repo: Repo = Repository::local_shared(storage.clone());
    repo.put_value(&key("a"), 1).await.unwrap();
    let coordinator = repo.resolve(&key("a")).await;

    storage.fail_writes(true);
    assert!(repo.clear(Some(&key("a"))).await.is_err());
    assert!(!coordinator.is_closed());
    assert!(Arc::ptr_eq(&coordinator, &repo.resolve(&key("a")).await));

    storage.fail_writes(false);
    repo.clear(Some(&key("a"))).await.unwrap();
    assert!(coordinator.is_closed());
    assert!(repo.get_all().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_resolve_replaces_closed_coordinator() {
    let repo: Repo = Repository::local(MemoryStorage::detached());
    let first = repo.resolve(&key("a")).await;
    assert!(Arc::ptr_eq(&first, &repo.resolve(&key("a")).await));

    first.close().await.unwrap();
    let second = repo.resolve(&key("a")).await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_closed());
  }

  #[tokio::test]
  async fn test_clear_all_closes_subscriptions() {
    let repo: Repo = Repository::local(MemoryStorage::detached());
    repo.put_value(&key("a"), 1).await.unwrap();
    let mut states = repo.resolve(&key("a")).await.subscribe().unwrap();

    repo.clear(None).await.unwrap();
    assert_eq!(states.recv().await, Some(Resource::success(Some(1))));
    assert_eq!(states.recv().await, None);
    assert!(repo.get_all().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_clear_all_drop_only_abandons_channels() {
    let repo: Repo = Repository::remote(|_: String, _: Option<()>| async { Ok(0) })
      .bulk_clear(BulkClearPolicy::DropOnly)
      .build();
    repo.put_value(&key("a"), 1).await.unwrap();
    let old = repo.resolve(&key("a")).await;

    repo.clear(None).await.unwrap();
    assert!(!old.is_closed());
    assert!(repo.get_all().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_queued_reload_args_policy() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());

    let repo: Repository<String, u32, String> = {
      let (seen, gate) = (seen.clone(), gate.clone());
      Repository::remote(move |_: String, args: Option<String>| {
        let (seen, gate) = (seen.clone(), gate.clone());
        async move {
          seen.lock().unwrap().push(args);
          gate.notified().await;
          Ok(1)
        }
      })
      .queued_reload_args(ReloadArgsPolicy::Reuse)
      .build()
    };

    let options = || {
      ObserveOptions::new()
        .force_reload(true)
        .fetch_args("page=2".to_string())
    };
    repo.observe(&key("k"), options()).await.unwrap();
    while seen.lock().unwrap().is_empty() {
      tokio::task::yield_now().await;
    }
    repo.observe(&key("k"), options()).await.unwrap();

    gate.notify_one();
    while seen.lock().unwrap().len() < 2 {
      tokio::task::yield_now().await;
    }
    gate.notify_one();

    let recorded = seen.lock().unwrap().clone();
    assert_eq!(
      recorded,
      vec![Some("page=2".to_string()), Some("page=2".to_string())]
    );
  }

  #[tokio::test]
  async fn test_duration_resolver_per_value() {
    let calls = Arc::new(AtomicU32::new(0));
    let repo: Repo = {
      let calls = calls.clone();
      Repository::remote(move |_: String, _: Option<()>| {
        let calls = calls.clone();
        async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) }
      })
      // Odd values never stay fresh
      .cache_duration_resolver(|_, value: &u32| {
        if value % 2 == 1 {
          Duration::zero()
        } else {
          Duration::minutes(5)
        }
      })
      .build()
    };

    repo.put_value(&key("even"), 2).await.unwrap();
    repo.put_value(&key("odd"), 3).await.unwrap();

    let even = repo
      .await_one(&key("even"), ObserveOptions::new().force_reload(false))
      .await
      .unwrap();
    assert_eq!(even, Resource::success(Some(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let odd = repo
      .await_one(&key("odd"), ObserveOptions::new().force_reload(false))
      .await
      .unwrap();
    assert_eq!(odd, Resource::success(Some(0)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
