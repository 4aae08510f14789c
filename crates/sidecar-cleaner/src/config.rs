//! Controller configuration
//!
//! Assembled by the operator binary from its command line; every field has a
//! default matching a stock Istio installation.

use std::time::Duration;

use sidecar_cleaner_common::Error;

use crate::cleanup::{CompletionPolicy, ShutdownCommand};
use crate::queue::RateLimitConfig;

/// Name of the injected Istio proxy container
pub const DEFAULT_SIDECAR_CONTAINER: &str = "istio-proxy";
/// Prefix shared by every container the mesh injects
pub const DEFAULT_SIDECAR_PREFIX: &str = "istio-";
/// Container whose presence means the workload stops its own sidecar
pub const DEFAULT_SELF_TERMINATING_CONTAINER: &str = "istio-quitquitquit";
/// Annotation a workload sets to opt out of cleanup
pub const DEFAULT_OPT_OUT_ANNOTATION: &str = "aoe.com/sidecar-cleaner";
/// Value of the opt-out annotation meaning "cleanup is built into the workload"
pub const OPT_OUT_EMBEDDED: &str = "embedded";
/// Attempts per key before the error is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Upper bound on a single shutdown exec
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(2);

/// How sidecar containers are recognised in a Pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarProfile {
    /// Container that receives the shutdown command
    pub sidecar_container: String,
    /// Containers with this prefix are ignored when judging the workload
    pub sidecar_prefix: String,
    /// Pods carrying this container are never touched
    pub self_terminating_container: String,
    /// Opt-out annotation key; the value `embedded` skips the Pod
    pub opt_out_annotation: String,
}

impl Default for SidecarProfile {
    fn default() -> Self {
        Self {
            sidecar_container: DEFAULT_SIDECAR_CONTAINER.to_string(),
            sidecar_prefix: DEFAULT_SIDECAR_PREFIX.to_string(),
            self_terminating_container: DEFAULT_SELF_TERMINATING_CONTAINER.to_string(),
            opt_out_annotation: DEFAULT_OPT_OUT_ANNOTATION.to_string(),
        }
    }
}

impl SidecarProfile {
    /// Whether a container name belongs to the mesh rather than the workload
    pub fn is_sidecar(&self, container: &str) -> bool {
        container.starts_with(&self.sidecar_prefix)
    }
}

/// Everything the controller needs besides a cluster client
#[derive(Clone, Debug)]
pub struct CleanerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Failed attempts per key before giving up
    pub max_retries: u32,
    /// Sidecar recognition rules
    pub profile: SidecarProfile,
    /// Command executed in the sidecar
    pub shutdown_command: ShutdownCommand,
    /// What to wait for after the command ran
    pub completion: CompletionPolicy,
    /// Upper bound on the exec call itself
    pub exec_timeout: Duration,
    /// Re-dispatch every cached Pod at this period; `None` disables it
    pub resync_period: Option<Duration>,
    /// Retry backoff and overall queue rate
    pub rate_limit: RateLimitConfig,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            profile: SidecarProfile::default(),
            shutdown_command: ShutdownCommand::default(),
            completion: CompletionPolicy::default(),
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            resync_period: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl CleanerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("workers", "must be at least 1"));
        }
        if self.exec_timeout.is_zero() {
            return Err(Error::config("exec_timeout", "must be greater than zero"));
        }
        if let CompletionPolicy::Confirm { interval, timeout } = self.completion {
            if interval.is_zero() {
                return Err(Error::config("confirm_interval", "must be greater than zero"));
            }
            if timeout < interval {
                return Err(Error::config(
                    "confirm_timeout",
                    "must not be shorter than the confirm interval",
                ));
            }
        }
        if self.profile.sidecar_container.is_empty() {
            return Err(Error::config("sidecar_container", "must not be empty"));
        }
        if self.profile.sidecar_prefix.is_empty() {
            return Err(Error::config(
                "sidecar_prefix",
                "must not be empty, it would hide every container",
            ));
        }
        if !self.profile.is_sidecar(&self.profile.sidecar_container) {
            return Err(Error::config(
                "sidecar_prefix",
                format!(
                    "'{}' does not match sidecar container '{}'",
                    self.profile.sidecar_prefix, self.profile.sidecar_container
                ),
            ));
        }
        Ok(())
    }
}
