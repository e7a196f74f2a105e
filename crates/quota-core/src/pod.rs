//! The per-pod state a quota group's `PodCache` tracks, and the lifecycle
//! phases that decide whether a pod counts toward `Used`.

use serde::{Deserialize, Serialize};

use crate::resources::ResourceAmount;

/// Coarse pod lifecycle phase, mirroring `PodStatus.phase` in the Kubernetes
/// API just closely enough to decide `Used` membership.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// A unique identifier for a pod (its Kubernetes UID). Newtype so
/// `PodCache` keys can't be confused with quota or namespace names.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodUid(pub String);

impl From<String> for PodUid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for PodUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A pod's entry in its quota group's `PodCache`: its request, phase, and
/// the two classification bits the accounting methods key off of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedPod {
    pub request: ResourceAmount,
    pub phase: PodPhase,
    /// Set by `Reserve`; once set, the pod counts toward `Used` regardless
    /// of its reported phase (spec.md §4.3 Reserve/Unreserve).
    pub is_assigned: bool,
    pub is_non_preemptible: bool,
}

impl CachedPod {
    pub fn new(request: ResourceAmount, phase: PodPhase, is_non_preemptible: bool) -> Self {
        Self {
            request,
            phase,
            is_assigned: false,
            is_non_preemptible,
        }
    }

    /// Whether this pod's request currently contributes to `Used` /
    /// `NonPreemptibleUsed`: bound/reserved by the scheduler, or already
    /// observed running by the informer (the two cases spec.md §4.3
    /// `OnPodAdd` and `Reserve` each produce).
    pub fn counts_as_used(&self) -> bool {
        self.is_assigned || matches!(self.phase, PodPhase::Running)
    }
}
