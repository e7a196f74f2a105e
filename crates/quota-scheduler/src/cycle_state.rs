//! A per-scheduling-cycle copy of the candidate quota group's usage, so
//! `AddPod`/`RemovePod` (hypothetical victim evaluation during preemption)
//! can mutate a speculative view without ever touching tree locks. Owned by
//! the cycle, never shared, so it needs no lock of its own (spec.md §4.3,
//! §5).

use quota_core::resources::ResourceAmount;

/// Captured once by `PreFilter`'s final step, then mutated in place by
/// `AddPod`/`RemovePod` during postfilter preemption evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleQuotaSnapshot {
    pub quota_name: String,
    pub runtime: ResourceAmount,
    pub used: ResourceAmount,
    pub non_preemptible_used: ResourceAmount,
}

/// Scheduler cycle state for this plugin. `Clone` because the scheduler
/// framework deep-copies cycle state when branching a cycle (e.g. across
/// preemption candidate nodes).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleState {
    snapshot: Option<CycleQuotaSnapshot>,
}

impl CycleState {
    pub fn set_snapshot(&mut self, snapshot: CycleQuotaSnapshot) {
        self.snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<&CycleQuotaSnapshot> {
        self.snapshot.as_ref()
    }

    /// Adjusts `used` by `+request` for a hypothetical victim/nominated pod.
    /// No-op if `PreFilter` never ran for this cycle.
    pub fn add_pod(&mut self, request: &ResourceAmount) {
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.used += request;
        }
    }

    /// Adjusts `used` by `-request`, the inverse of [`CycleState::add_pod`].
    pub fn remove_pod(&mut self, request: &ResourceAmount) {
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.used -= request;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> CycleQuotaSnapshot {
        CycleQuotaSnapshot {
            quota_name: "g".to_string(),
            runtime: ResourceAmount::cpu_mem(100, 100),
            used: ResourceAmount::cpu_mem(10, 10),
            non_preemptible_used: ResourceAmount::zero(),
        }
    }

    #[test]
    fn add_then_remove_pod_is_a_no_op() {
        let mut state = CycleState::default();
        state.set_snapshot(snapshot());
        let request = ResourceAmount::cpu_mem(5, 5);

        state.add_pod(&request);
        assert_eq!(state.snapshot().unwrap().used, ResourceAmount::cpu_mem(15, 15));

        state.remove_pod(&request);
        assert_eq!(state.snapshot().unwrap().used, ResourceAmount::cpu_mem(10, 10));
    }

    #[test]
    fn mutation_without_a_snapshot_is_a_no_op() {
        let mut state = CycleState::default();
        state.add_pod(&ResourceAmount::cpu_mem(5, 5));
        assert!(state.snapshot().is_none());
    }
}
