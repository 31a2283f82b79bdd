use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{Config, RemoteConfig};

/// HTTP origin the cache fetches JSON documents from.
#[derive(Clone)]
pub struct RemoteClient {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl RemoteClient {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let base_url = parse_base_url(&config.base_url)?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::get_api_token(),
    })
  }

  /// URL a key is fetched from.
  pub fn url_for(&self, key: &str) -> Result<Url> {
    self
      .base_url
      .join(key)
      .map_err(|e| eyre!("Invalid cache key {} for {}: {}", key, self.base_url, e))
  }

  /// GET the JSON document stored under `key`.
  pub async fn fetch(&self, key: &str) -> Result<Value> {
    let url = self.url_for(key)?;
    debug!(%url, "Fetching from origin");

    let mut request = self.client.get(url.clone());
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Origin rejected {}: {}", url, e))?;

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }
}

/// Parse the base URL, making sure relative joins append to its last segment.
fn parse_base_url(raw: &str) -> Result<Url> {
  let normalized = if raw.ends_with('/') {
    raw.to_string()
  } else {
    format!("{}/", raw)
  };
  Url::parse(&normalized).map_err(|e| eyre!("Invalid base URL {}: {}", raw, e))
}
