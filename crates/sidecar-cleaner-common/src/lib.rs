//! Common pieces for the sidecar cleaner: errors, kube client helpers, telemetry

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Service name reported in logs, traces and metrics
pub const CONTROLLER_NAME: &str = "sidecar-cleaner";
