use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::commands::{self, Command};
use keycache::cache::{CacheStorage, MemoryStorage, ObserveOptions, Repository, SqliteStorage};
use keycache::config::{Config, StorageKind};
use keycache::remote::RemoteClient;

/// Cache of JSON documents keyed by path segment
pub type JsonRepository = Repository<String, Value>;

/// Main application state
pub struct App {
  repo: JsonRepository,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    Ok(Self {
      repo: build_repository(config)?,
    })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    info!(?command, remote = self.repo.is_remote(), "Running command");

    match command {
      Command::Get { key, refresh } => {
        let state = self
          .repo
          .await_one(&key, ObserveOptions::new().force_reload(refresh))
          .await?;
        commands::print_resource(&key, state)
      }
      Command::Put { key, value } => {
        self.repo.put_value(&key, commands::parse_value(&value)).await
      }
      Command::Invalidate { key } => {
        // Each run starts with an empty registry, so make sure the key has a coordinator
        let coordinator = self.repo.resolve(&key).await;
        self.repo.invalidate(&key).await?;
        match coordinator.current() {
          Some(state) => commands::print_resource(&key, state),
          None => Ok(()),
        }
      }
      Command::Clear { key } => self.repo.clear(key.as_ref()).await,
      Command::List => {
        let values = self.repo.get_all().await?;
        println!("{}", commands::render(&Value::Array(values))?);
        Ok(())
      }
    }
  }
}

fn build_repository(config: &Config) -> Result<JsonRepository> {
  let box_name = &config.cache.box_name;
  let storage: Arc<dyn CacheStorage<String, Value>> = match config.cache.storage {
    StorageKind::Sqlite => match &config.cache.path {
      Some(path) => Arc::new(SqliteStorage::<Value>::open_at(path, box_name)?),
      None => Arc::new(SqliteStorage::<Value>::open(box_name)?),
    },
    StorageKind::Memory => Arc::new(MemoryStorage::<String, Value>::named(box_name.clone())),
  };

  let Some(remote) = &config.remote else {
    return Ok(Repository::local_shared(storage));
  };

  let client = RemoteClient::new(remote)?;
  let ttl = i64::try_from(config.cache.ttl_secs)
    .ok()
    .and_then(Duration::try_seconds)
    .ok_or_else(|| eyre!("cache.ttl_secs is out of range: {}", config.cache.ttl_secs))?;

  Ok(
    Repository::remote(move |key: String, _: Option<()>| {
      let client = client.clone();
      async move { client.fetch(&key).await }
    })
    .shared_storage(storage)
    .cache_duration(ttl)
    .build(),
  )
}
