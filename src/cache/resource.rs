//! The state of a cached value as seen by observers.

use color_eyre::eyre::Report;
use std::sync::Arc;

/// The state of one cached key.
///
/// Every transition a key coordinator makes is broadcast as a `Resource`.
/// `Loading` is transient; `Success` and `Error` end a load cycle.
#[derive(Debug, Clone)]
pub enum Resource<V> {
  /// A load is in flight, carrying the last known value if any
  Loading { previous_data: Option<V> },
  /// The value is current as of this emission
  Success { data: Option<V> },
  /// The fetch failed; `data` falls back to the last cached value
  Error {
    message: String,
    cause: Arc<Report>,
    data: Option<V>,
  },
}

impl<V> Resource<V> {
  pub fn loading(previous_data: Option<V>) -> Self {
    Resource::Loading { previous_data }
  }

  pub fn success(data: Option<V>) -> Self {
    Resource::Success { data }
  }

  /// Build an error state from a failed fetch.
  pub fn error(cause: Report, data: Option<V>) -> Self {
    Resource::Error {
      message: cause.to_string(),
      cause: Arc::new(cause),
      data,
    }
  }

  pub fn is_loading(&self) -> bool {
    matches!(self, Resource::Loading { .. })
  }

  pub fn is_error(&self) -> bool {
    matches!(self, Resource::Error { .. })
  }

  /// The value carried by this state, whichever variant it is.
  pub fn data(&self) -> Option<&V> {
    match self {
      Resource::Loading { previous_data } => previous_data.as_ref(),
      Resource::Success { data } => data.as_ref(),
      Resource::Error { data, .. } => data.as_ref(),
    }
  }

  pub fn into_data(self) -> Option<V> {
    match self {
      Resource::Loading { previous_data } => previous_data,
      Resource::Success { data } => data,
      Resource::Error { data, .. } => data,
    }
  }

  pub fn error_message(&self) -> Option<&str> {
    match self {
      Resource::Error { message, .. } => Some(message),
      _ => None,
    }
  }
}

// Causes are compared by identity: two errors are the same emission only if
// they come from the same failed fetch.
impl<V: PartialEq> PartialEq for Resource<V> {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Resource::Loading { previous_data: a }, Resource::Loading { previous_data: b }) => a == b,
      (Resource::Success { data: a }, Resource::Success { data: b }) => a == b,
      (
        Resource::Error {
          message: m1,
          cause: c1,
          data: d1,
        },
        Resource::Error {
          message: m2,
          cause: c2,
          data: d2,
        },
      ) => m1 == m2 && Arc::ptr_eq(c1, c2) && d1 == d2,
      _ => false,
    }
  }
}
