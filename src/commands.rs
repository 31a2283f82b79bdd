//! Command-line subcommands and their output formatting.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use keycache::cache::Resource;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Print the value for a key, fetching it when missing or stale
  Get {
    key: String,
    /// Fetch from the origin even if the cached value is fresh
    #[arg(short, long)]
    refresh: bool,
  },
  /// Store a value (JSON, or a plain string) under a key
  Put { key: String, value: String },
  /// Mark a key stale and reload it from the origin
  Invalidate { key: String },
  /// Remove one key, or everything when no key is given
  Clear { key: Option<String> },
  /// Print every cached value as a JSON array
  List,
}

/// Interpret command-line input as JSON, falling back to a string value.
pub fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn render(value: &Value) -> Result<String> {
  serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render value: {}", e))
}

/// Print a settled state. Errors and missing values become command failures.
pub fn print_resource(key: &str, state: Resource<Value>) -> Result<()> {
  match state {
    Resource::Error { message, data, .. } => {
      if let Some(stale) = data {
        eprintln!("Serving cached value, refresh failed");
        println!("{}", render(&stale)?);
      }
      Err(eyre!("Failed to load {}: {}", key, message))
    }
    state => match state.into_data() {
      Some(value) => {
        println!("{}", render(&value)?);
        Ok(())
      }
      None => Err(eyre!("No value cached for {}", key)),
    },
  }
}
