//! Cheap admission filter applied to every Pod event
//!
//! Only decides whether a Pod is worth queueing. The final decision is made
//! by the reconciler against the Pod's state at processing time.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::config::{SidecarProfile, OPT_OUT_EMBEDDED};
use crate::pod::{self, ContainerState, PodPhase};

/// Owner kind of batch Jobs
const JOB_KIND: &str = "Job";

/// Waiting reason of a container that is still being set up normally
const CONTAINER_CREATING: &str = "ContainerCreating";

/// Whether a Pod event should put the Pod on the work queue
pub fn can_process(pod: &Pod, profile: &SidecarProfile) -> bool {
    pod::is_owned_by_kind(pod, JOB_KIND)
        && has_cleanable_sidecar(pod, profile)
        && !has_embedded_cleanup(pod, profile)
        && is_active(pod)
}

/// The Pod runs the sidecar and does not stop it by itself
fn has_cleanable_sidecar(pod: &Pod, profile: &SidecarProfile) -> bool {
    let mut found = false;
    for name in pod::container_names(pod) {
        if name == profile.self_terminating_container {
            return false;
        }
        if name == profile.sidecar_container {
            found = true;
        }
    }
    found
}

fn has_embedded_cleanup(pod: &Pod, profile: &SidecarProfile) -> bool {
    pod.annotations()
        .get(&profile.opt_out_annotation)
        .is_some_and(|value| value == OPT_OUT_EMBEDDED)
}

/// Running, or Pending with a container stuck in something other than creation
///
/// Pods that fail image pulls or crash-loop never reach Running and would
/// otherwise not be looked at again until their next event.
fn is_active(pod: &Pod) -> bool {
    match pod::phase(pod) {
        PodPhase::Running => true,
        PodPhase::Pending => pod::container_states(pod).any(|(_, state)| {
            matches!(
                state,
                ContainerState::Waiting { reason } if reason.as_deref() != Some(CONTAINER_CREATING)
            )
        }),
        _ => false,
    }
}
