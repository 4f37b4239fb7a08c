//! Pod update classification shared by the registrar handlers.
//!
//! Kubernetes delivers many intermediate update events (status polling,
//! resync) that are neither a go-live nor a teardown. The classifier only
//! reacts to the two clean transition edges and reports everything else as
//! [`PodTransition::Unknown`]; callers needing exactly-once side effects
//! layer the coordinator on top.

use k8s_openapi::api::core::v1::{Pod, PodCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodTransition {
    /// The pod went live: register its declared services.
    Activate,
    /// The pod is being torn down: remove its registrations.
    Teardown,
    /// Neither edge matched; no side effect, surfaced for operator attention.
    Unknown,
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

fn conditions(pod: &Pod) -> &[PodCondition] {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or(&[])
}

/// Whether the pod reports a `ContainersReady` condition with status `True`.
/// A pod lacking the condition entirely is considered not ready.
pub fn containers_ready(pod: &Pod) -> bool {
    conditions(pod)
        .iter()
        .any(|c| c.type_ == "ContainersReady" && c.status == "True")
}

/// Whether the pod already carries deletion finalizers, i.e. is departing.
pub fn is_departing(pod: &Pod) -> bool {
    pod.metadata
        .finalizers
        .as_ref()
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

/// Classify one observed pod update against its previous state.
pub fn classify(pod: &Pod, old_pod: &Pod) -> PodTransition {
    if pod.metadata.deletion_timestamp.is_some() && phase(old_pod) == "Running" {
        PodTransition::Teardown
    } else if phase(pod) == "Running" && !containers_ready(old_pod) {
        PodTransition::Activate
    } else {
        PodTransition::Unknown
    }
}
