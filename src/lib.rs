//! Per-key, asynchronously loaded cache with reactive change notification.
//!
//! See [`cache::Repository`] for the entry point.

pub mod cache;
pub mod config;
pub mod remote;
