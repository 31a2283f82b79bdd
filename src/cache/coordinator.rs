//! Per-key load coordinator.
//!
//! A `KeyCoordinator` owns the lifecycle of one cached key:
//! 1. Staleness check against the stored entry's write time
//! 2. At most one fetch in flight, with force reloads coalesced into one follow-up
//! 3. Fetch failures surfaced as `Resource::Error` carrying the last cached value
//! 4. Every state broadcast on a replay-latest channel

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use super::channel::{ReplayChannel, Subscription};
use super::error::ResourceClosed;
use super::lock::mutex_lock;
use super::policy::{CacheDurationResolver, ReloadArgsPolicy};
use super::resource::Resource;
use super::storage::CacheStorage;
use super::traits::{now_millis, CacheKey, CacheValue, FetchArgs};

/// Loads a value for a key from the external source.
pub type FetchFn<K, V, A> = Arc<dyn Fn(K, Option<A>) -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Callback run on every freshly fetched value before it is stored.
pub type SideEffect<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Collaborators shared by every coordinator of one repository.
pub struct LoadContext<K, V, A> {
  pub storage: Arc<dyn CacheStorage<K, V>>,
  /// `None` in local mode
  pub fetcher: Option<FetchFn<K, V, A>>,
  pub cache_duration: CacheDurationResolver<K, V>,
  pub reload_args: ReloadArgsPolicy,
}

/// Parameters of one `load` call.
pub struct LoadRequest<V, A> {
  pub force_reload: bool,
  pub side_effect: Option<SideEffect<V>>,
  pub fetch_args: Option<A>,
  /// Emit `Loading` even when there is no previous state to show
  pub allow_empty_loading: bool,
}

impl<V, A> LoadRequest<V, A> {
  pub fn new(force_reload: bool) -> Self {
    Self {
      force_reload,
      side_effect: None,
      fetch_args: None,
      allow_empty_loading: false,
    }
  }

  /// The request a queued reload runs with.
  fn requeued(&self, policy: ReloadArgsPolicy) -> Self
  where
    A: Clone,
  {
    Self {
      force_reload: self.force_reload,
      side_effect: self.side_effect.clone(),
      fetch_args: match policy {
        ReloadArgsPolicy::Drop => None,
        ReloadArgsPolicy::Reuse => self.fetch_args.clone(),
      },
      allow_empty_loading: self.allow_empty_loading,
    }
  }
}

impl<V, A> Default for LoadRequest<V, A> {
  fn default() -> Self {
    Self::new(false)
  }
}

#[derive(Debug, Default)]
struct LoadFlags {
  loading: bool,
  reload_pending: bool,
  closed: bool,
}

/// Owns the load/refresh/invalidate state machine of one key.
pub struct KeyCoordinator<K, V, A = ()> {
  key: K,
  context: Arc<LoadContext<K, V, A>>,
  channel: ReplayChannel<Resource<V>>,
  flags: Mutex<LoadFlags>,
  /// Serializes storage mutation and emission sequences for this key
  critical: tokio::sync::Mutex<()>,
}

impl<K: CacheKey, V: CacheValue, A: FetchArgs> KeyCoordinator<K, V, A> {
  pub fn new(key: K, context: Arc<LoadContext<K, V, A>>) -> Self {
    Self {
      key,
      context,
      channel: ReplayChannel::new(),
      flags: Mutex::new(LoadFlags::default()),
      critical: tokio::sync::Mutex::new(()),
    }
  }

  pub fn is_loading(&self) -> bool {
    self.flags().loading
  }

  pub fn is_closed(&self) -> bool {
    self.flags().closed
  }

  /// The most recent state, if any was emitted.
  pub fn current(&self) -> Option<Resource<V>> {
    self.channel.latest()
  }

  /// Subscribe without triggering a load.
  pub fn subscribe(&self) -> Result<Subscription<Resource<V>>> {
    self.ensure_open()?;
    Ok(self.channel.subscribe())
  }

  /// Start loading the key unless a load is already running.
  ///
  /// Returns immediately with a subscription to the key's channel. While a
  /// load is in flight a forced request is queued (at most one) and a plain
  /// request just joins the running cycle.
  pub fn load(self: &Arc<Self>, request: LoadRequest<V, A>) -> Result<Subscription<Resource<V>>> {
    let start = {
      let mut flags = self.flags();
      if flags.closed {
        return Err(self.closed_error());
      }
      if flags.loading {
        if request.force_reload {
          debug!(key = %self.key, "Load in flight, queueing forced reload");
          flags.reload_pending = true;
        }
        false
      } else {
        flags.loading = true;
        true
      }
    };

    if start {
      // Emitted before subscribing so callers never mistake the previous
      // terminal state for the outcome of this load
      self.emit_cycle_loading(request.allow_empty_loading);
    }
    let subscription = self.channel.subscribe();

    if start {
      let coordinator = Arc::clone(self);
      tokio::spawn(async move { coordinator.run_cycles(request).await });
    }

    Ok(subscription)
  }

  /// Run load cycles until no reload is queued.
  async fn run_cycles(self: Arc<Self>, mut request: LoadRequest<V, A>) {
    loop {
      if let Err(err) = self.load_process(&request).await {
        error!(key = %self.key, error = %err, "Cache load failed");
        let data = self.channel.latest().and_then(Resource::into_data);
        self.emit(Resource::error(err, data));
      }

      {
        let mut flags = self.flags();
        if flags.reload_pending && !flags.closed {
          flags.reload_pending = false;
        } else {
          flags.loading = false;
          return;
        }
      }

      debug!(key = %self.key, "Running queued reload");
      request = request.requeued(self.context.reload_args);
      self.emit_cycle_loading(request.allow_empty_loading);
    }
  }

  /// One load cycle: read the cache, decide whether to fetch, emit the outcome.
  async fn load_process(&self, request: &LoadRequest<V, A>) -> Result<()> {
    let _guard = self.critical.lock().await;
    if self.is_closed() {
      return Ok(());
    }
    self.flags().reload_pending = false;

    let entry = self.context.storage.get(&self.key).await?;

    let mut force = request.force_reload;
    if let Some(entry) = &entry {
      let ttl = (self.context.cache_duration)(&self.key, &entry.data);
      if entry.store_time < now_millis() - ttl.num_milliseconds() {
        debug!(key = %self.key, store_time = entry.store_time, "Cached entry is stale");
        force = true;
      }
    }

    let previous = entry.map(|entry| entry.data);
    let fetcher = match &self.context.fetcher {
      Some(fetcher) if force || previous.is_none() => Arc::clone(fetcher),
      _ => {
        self.emit(Resource::success(previous));
        return Ok(());
      }
    };

    if previous.is_some() {
      self.emit(Resource::loading(previous.clone()));
    }
    // The fetch below covers any reload requested up to this point
    self.flags().reload_pending = false;

    debug!(key = %self.key, force, "Fetching");
    match fetcher(self.key.clone(), request.fetch_args.clone()).await {
      Ok(value) => {
        if let Some(side_effect) = &request.side_effect {
          side_effect(&value);
        }
        self
          .context
          .storage
          .put(&self.key, value.clone(), None)
          .await?;
        self.emit(Resource::success(Some(value)));
      }
      Err(err) => {
        warn!(key = %self.key, error = %err, "Fetch failed, keeping cached value");
        self.emit(Resource::error(err, previous));
      }
    }

    Ok(())
  }

  /// Replace the stored value with `transform(current)`.
  ///
  /// A `Some` result keeps the entry's write time (or marks it stale if there
  /// was no entry). A `None` result deletes the entry and only notifies
  /// observers when `notify_on_null` is set.
  pub async fn update_value<F>(&self, transform: F, notify_on_null: bool) -> Result<()>
  where
    F: FnOnce(Option<V>) -> Option<V> + Send,
  {
    self.ensure_open()?;
    let _guard = self.critical.lock().await;
    self.ensure_open()?;

    let entry = self.context.storage.get(&self.key).await?;
    let existed = entry.is_some();
    let store_time = entry.as_ref().map(|entry| entry.store_time).unwrap_or(0);

    match transform(entry.map(|entry| entry.data)) {
      Some(value) => {
        self
          .context
          .storage
          .put(&self.key, value.clone(), Some(store_time))
          .await?;
        self.emit(Resource::success(Some(value)));
      }
      None => {
        if existed {
          self.context.storage.delete(&self.key).await?;
        }
        if notify_on_null {
          self.emit(Resource::success(None));
        }
      }
    }

    Ok(())
  }

  /// Store `value` as fresh and broadcast it.
  pub async fn put_value(&self, value: V) -> Result<()> {
    self.ensure_open()?;
    let _guard = self.critical.lock().await;
    self.ensure_open()?;

    self
      .context
      .storage
      .put(&self.key, value.clone(), None)
      .await?;
    self.emit(Resource::success(Some(value)));
    Ok(())
  }

  /// Mark the entry stale and reload it, waiting for the reload's outcome.
  ///
  /// The cached value is kept, so it stays available if the fetch fails.
  pub async fn invalidate(self: &Arc<Self>) -> Result<()> {
    self.mark_stale().await?;

    let mut subscription = self.load(LoadRequest::new(true))?;
    match subscription.next_settled().await {
      Some(_) => Ok(()),
      None => Err(self.closed_error()),
    }
  }

  async fn mark_stale(&self) -> Result<()> {
    self.ensure_open()?;
    let _guard = self.critical.lock().await;
    self.ensure_open()?;

    if let Some(entry) = self.context.storage.get(&self.key).await? {
      self
        .context
        .storage
        .put(&self.key, entry.data, Some(0))
        .await?;
    }
    Ok(())
  }

  /// Delete the cached entry and end the channel. The coordinator is unusable afterwards.
  pub async fn close(&self) -> Result<()> {
    self.ensure_open()?;
    let _guard = self.critical.lock().await;
    self.ensure_open()?;

    self
      .context
      .storage
      .delete(&self.key)
      .await
      .map_err(|e| eyre!("Failed to close cache resource {}: {}", self.key, e))?;

    self.flags().closed = true;
    self.channel.close();
    debug!(key = %self.key, "Closed key coordinator");
    Ok(())
  }

  /// Emit `Loading` at the start of a cycle when there is something to show.
  fn emit_cycle_loading(&self, allow_empty_loading: bool) {
    let previous = self.channel.latest();
    if previous.is_some() || allow_empty_loading {
      self.emit(Resource::loading(previous.and_then(Resource::into_data)));
    }
  }

  fn emit(&self, state: Resource<V>) {
    self.channel.send(state);
  }

  fn flags(&self) -> std::sync::MutexGuard<'_, LoadFlags> {
    mutex_lock(&self.flags, "coordinator.flags")
  }

  fn ensure_open(&self) -> Result<()> {
    if self.is_closed() {
      return Err(self.closed_error());
    }
    Ok(())
  }

  fn closed_error(&self) -> color_eyre::eyre::Report {
    ResourceClosed::new(self.key.to_string()).into()
  }
}
