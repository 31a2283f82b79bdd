//! Per-key reactive cache.
//!
//! This module provides:
//! - `Repository`: a registry of per-key coordinators with cross-key operations
//! - `KeyCoordinator`: staleness checks, fetch coalescing and error fallback for one key
//! - `Resource`: the loading/success/error states broadcast to observers
//! - `CacheStorage`: the storage contract, with memory and SQLite backends

mod channel;
mod coordinator;
mod error;
mod lock;
mod policy;
mod repository;
mod resource;
pub mod storage;
mod traits;

pub use channel::{ReplayChannel, Subscription};
pub use coordinator::{FetchFn, KeyCoordinator, LoadContext, LoadRequest, SideEffect};
pub use error::{is_closed_error, ResourceClosed};
pub use policy::{
  default_cache_duration, fixed_duration, BulkClearPolicy, CacheDurationResolver,
  ReloadArgsPolicy,
};
pub use repository::{ObserveOptions, Repository, RepositoryBuilder};
pub use resource::Resource;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{now_millis, CacheEntry, CacheKey, CacheValue, FetchArgs};
