//! Typed read-only views over `k8s_openapi` Pods
//!
//! The API types are stringly typed and mostly optional; the accessors here
//! apply the API server defaults once so predicates can match on enums.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;

/// Identifies one Pod in the work queue: `namespace/name`
///
/// A key points at the latest cached state, never at a captured snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    /// Pod namespace (empty only for malformed objects)
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key of a Pod
    ///
    /// Works on the last known state of a deleted Pod as well. Returns `None`
    /// when the object carries no name, which only happens for objects that
    /// never came from the API server.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        Some(Self {
            namespace: pod.namespace().unwrap_or_default(),
            name,
        })
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Error parsing a [`PodKey`] from its string form
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid pod key '{0}': expected <namespace>/<name>")]
pub struct InvalidPodKey(String);

impl FromStr for PodKey {
    type Err = InvalidPodKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [namespace, name] if !name.is_empty() => Ok(Self::new(*namespace, *name)),
            _ => Err(InvalidPodKey(s.to_string())),
        }
    }
}

/// Pod lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Succeeded and Failed are final; nothing in the Pod will run again
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl From<Option<&str>> for PodPhase {
    fn from(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Pod restart policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

impl From<Option<&str>> for RestartPolicy {
    fn from(policy: Option<&str>) -> Self {
        match policy {
            Some("OnFailure") => RestartPolicy::OnFailure,
            Some("Never") => RestartPolicy::Never,
            // API server default
            _ => RestartPolicy::Always,
        }
    }
}

/// Projected state of one container; exactly one variant applies
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Waiting { reason: Option<String> },
    Running,
    Terminated { reason: Option<String> },
}

impl ContainerState {
    fn of(status: &ContainerStatus) -> Self {
        let Some(state) = status.state.as_ref() else {
            return ContainerState::Waiting { reason: None };
        };
        if let Some(terminated) = &state.terminated {
            ContainerState::Terminated {
                reason: terminated.reason.clone(),
            }
        } else if state.running.is_some() {
            ContainerState::Running
        } else {
            ContainerState::Waiting {
                reason: state.waiting.as_ref().and_then(|w| w.reason.clone()),
            }
        }
    }
}

/// Current phase of the Pod
pub fn phase(pod: &Pod) -> PodPhase {
    PodPhase::from(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// Restart policy from the Pod spec
pub fn restart_policy(pod: &Pod) -> RestartPolicy {
    RestartPolicy::from(pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref()))
}

/// Names of the containers declared in the spec, in order
pub fn container_names(pod: &Pod) -> impl Iterator<Item = &str> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .map(|c| c.name.as_str())
}

/// `(name, state)` for each reported container status, in order
pub fn container_states(pod: &Pod) -> impl Iterator<Item = (&str, ContainerState)> {
    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .map(|cs| (cs.name.as_str(), ContainerState::of(cs)))
}

/// Whether any owner reference has the given kind
pub fn is_owned_by_kind(pod: &Pod, kind: &str) -> bool {
    pod.owner_references().iter().any(|owner| owner.kind == kind)
}
