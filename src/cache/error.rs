use thiserror::Error;

/// Raised by any operation on a key coordinator after it was closed.
///
/// Carried inside an `eyre::Report`; detect it with
/// `report.downcast_ref::<ResourceClosed>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cache resource for key '{key}' is already closed")]
pub struct ResourceClosed {
  pub key: String,
}

impl ResourceClosed {
  pub fn new(key: impl Into<String>) -> Self {
    Self { key: key.into() }
  }
}

/// Whether an error chain was caused by using a closed coordinator.
pub fn is_closed_error(report: &color_eyre::eyre::Report) -> bool {
  report.downcast_ref::<ResourceClosed>().is_some()
}
