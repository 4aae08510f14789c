//! Per-key reconciliation and failure policy
//!
//! A worker hands a key to [`Reconciler::reconcile`], which re-reads the Pod
//! from the cache and decides whether its sidecar is the only thing left
//! running. [`handle_err`] then turns the outcome into a retry, a reset, or
//! a drop.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cleanup::SidecarCleaner;
use crate::config::SidecarProfile;
use crate::error::CleanerError;
use crate::feed::PodFeed;
use crate::metrics;
use crate::pod::{self, ContainerState, PodKey, RestartPolicy};
use crate::queue::RetryQueue;

/// Termination reason the kubelet reports for a non-zero exit
const REASON_ERROR: &str = "Error";

/// Primary container counts used to decide whether cleanup is due
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerTally {
    /// Waiting or Running
    pub active: u32,
    /// Terminated for any reason
    pub terminated: u32,
    /// Terminated with `Error` where the kubelet may still restart it
    pub errored: u32,
}

impl ContainerTally {
    /// Count the Pod's primary containers; sidecars are skipped
    pub fn of(pod: &Pod, profile: &SidecarProfile) -> Self {
        let restarts_on_error = pod::restart_policy(pod) != RestartPolicy::Never;
        let mut tally = Self::default();

        for (name, state) in pod::container_states(pod) {
            if profile.is_sidecar(name) {
                continue;
            }
            match state {
                ContainerState::Waiting { .. } | ContainerState::Running => tally.active += 1,
                ContainerState::Terminated { reason } => {
                    tally.terminated += 1;
                    if restarts_on_error && reason.as_deref() == Some(REASON_ERROR) {
                        tally.errored += 1;
                    }
                }
            }
        }

        tally
    }

    /// Nothing left to run and nothing about to be restarted
    pub fn should_cleanup(&self) -> bool {
        self.active == 0 && self.terminated > 0 && self.errored == 0
    }
}

/// Branch taken by a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// The Pod is no longer cached
    Missing,
    /// The Pod already Succeeded or Failed
    Terminal,
    /// Primary containers are still running or may restart
    Waiting,
    /// This Pod's sidecar was already stopped by this process
    AlreadyCleaned,
    /// The sidecar was stopped now
    CleanedUp,
}

impl Reconciled {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reconciled::Missing => "missing",
            Reconciled::Terminal => "terminal",
            Reconciled::Waiting => "waiting",
            Reconciled::AlreadyCleaned => "already_cleaned",
            Reconciled::CleanedUp => "cleaned_up",
        }
    }
}

/// Decides and performs cleanup for one key at a time
pub struct Reconciler {
    feed: Arc<dyn PodFeed>,
    cleaner: SidecarCleaner,
    profile: SidecarProfile,
    /// UID of the Pod last cleaned under each key
    cleaned: Mutex<HashMap<PodKey, String>>,
}

impl Reconciler {
    pub fn new(feed: Arc<dyn PodFeed>, cleaner: SidecarCleaner, profile: SidecarProfile) -> Self {
        Self {
            feed,
            cleaner,
            profile,
            cleaned: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the latest cached state of `key`
    pub async fn reconcile(&self, key: &PodKey) -> Result<Reconciled, CleanerError> {
        let Some(pod) = self.feed.get(key) else {
            self.cleaned.lock().remove(key);
            debug!(pod = %key, "Pod no longer exists");
            return Ok(Reconciled::Missing);
        };

        if pod::phase(&pod).is_terminal() {
            debug!(pod = %key, phase = ?pod::phase(&pod), "Pod already finished");
            return Ok(Reconciled::Terminal);
        }

        let tally = ContainerTally::of(&pod, &self.profile);
        if !tally.should_cleanup() {
            debug!(
                pod = %key,
                active = tally.active,
                terminated = tally.terminated,
                errored = tally.errored,
                "Primary containers not finished"
            );
            return Ok(Reconciled::Waiting);
        }

        let uid = pod.uid();
        if let Some(uid) = &uid {
            if self.cleaned.lock().get(key) == Some(uid) {
                debug!(pod = %key, "Sidecar already stopped");
                return Ok(Reconciled::AlreadyCleaned);
            }
        }

        info!(
            pod = %key,
            terminated = tally.terminated,
            "Primary containers finished, stopping sidecar"
        );
        self.cleaner.cleanup(key).await?;

        if let Some(uid) = uid {
            self.cleaned.lock().insert(key.clone(), uid);
        }
        Ok(Reconciled::CleanedUp)
    }
}

/// Sink for errors that exhausted their retries
#[cfg_attr(test, mockall::automock)]
pub trait ErrorReporter: Send + Sync {
    fn report(&self, key: &PodKey, error: &CleanerError);
}

/// Logs dropped errors and counts them
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, key: &PodKey, error: &CleanerError) {
        error!(pod = %key, error = %error, "Dropping pod out of the queue");
        metrics::DROPPED.add(1, &[KeyValue::new("error_kind", error.kind())]);
    }
}

/// Apply the failure policy to the outcome of one reconcile
///
/// Success resets the key's retry counter. A failure is retried with backoff
/// until `max_retries` attempts have failed, then forgotten and reported.
pub fn handle_err(
    queue: &RetryQueue<PodKey>,
    key: &PodKey,
    result: &Result<Reconciled, CleanerError>,
    max_retries: u32,
    reporter: &dyn ErrorReporter,
) {
    match result {
        Ok(reconciled) => {
            metrics::RECONCILES.add(1, &metrics::result_label(reconciled.as_str()));
            queue.forget(key);
        }
        Err(e) => {
            metrics::RECONCILES.add(1, &metrics::result_label("error"));
            let attempts = queue.num_requeues(key) + 1;
            if attempts < max_retries {
                warn!(pod = %key, attempt = attempts, error = %e, "Reconcile failed, retrying");
                metrics::REQUEUES.add(1, &[]);
                queue.add_rate_limited(key.clone());
                return;
            }

            queue.forget(key);
            reporter.report(key, e);
        }
    }
}
