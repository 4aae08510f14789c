//! Sidecar cleaner reconciliation core
//!
//! Watches Pods owned by Jobs and, once every primary container has finished,
//! asks the injected mesh sidecar to quit so the Pod can complete:
//! - [`classifier`] filters cache events cheaply before anything is queued
//! - [`queue`] deduplicates keys and rate-limits retries
//! - [`reconciler`] re-reads the Pod and decides whether cleanup is due
//! - [`cleanup`] execs the shutdown command and optionally waits for completion
//! - [`controller`] wires the feed, queue and workers together

pub mod classifier;
pub mod cleanup;
pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod pod;
pub mod queue;
pub mod reconciler;

#[cfg(test)]
mod testing;

pub use config::CleanerConfig;
pub use controller::Controller;
pub use error::CleanerError;
pub use pod::PodKey;
