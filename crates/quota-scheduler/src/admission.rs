//! Admission entry points: `PreFilter`, `Reserve`/`Unreserve`, and the
//! cycle-local `AddPod`/`RemovePod` used during preemption victim evaluation
//! (spec.md §4.3).

use k8s_openapi::api::core::v1::Pod;
use quota_core::{registry::QuotaManagerRegistry, resources::{Dimension, ResourceAmount}};

use crate::{
    config::PluginConfig,
    cycle_state::{CycleQuotaSnapshot, CycleState},
    error::PluginResult,
    events::{is_non_preemptible, pod_total_request, pod_uid, resolve_quota_name},
};

/// The two outcomes admission can report. Never `Error` for a quota
/// violation — message text is part of the contract (spec.md §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Unschedulable(String),
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }
}

/// Renders the way spec-literal denial messages do: `[cpu, memory]`, lower
/// case, via `Dimension`'s own `Display` rather than its derived `Debug`.
fn format_dimensions(dims: &[Dimension]) -> String {
    format!("[{}]", dims.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))
}

/// Evaluates a pending pod against its resolved quota group's runtime share,
/// its non-preemptible floor, and (if configured) every ancestor's share.
/// On success, snapshots the group's counters into `cycle_state` for
/// `AddPod`/`RemovePod` to mutate during postfilter preemption evaluation.
pub fn pre_filter(
    registry: &QuotaManagerRegistry,
    config: &PluginConfig,
    pod: &Pod,
    cycle_state: &mut CycleState,
) -> PluginResult<Verdict> {
    let request = pod_total_request(pod)?;
    let quota_name = resolve_quota_name(pod, registry);

    let Some(manager) = registry.manager_of(&quota_name) else {
        return Ok(Verdict::Unschedulable(format!("quota group {quota_name:?} does not exist")));
    };
    let Some(quota) = manager.get_quota_info(&quota_name) else {
        return Ok(Verdict::Unschedulable(format!("quota group {quota_name:?} does not exist")));
    };

    if config.enable_runtime_quota {
        let runtime = manager.refresh_runtime(&quota_name).unwrap_or_else(ResourceAmount::zero);
        let used = quota.used();
        let exceeded = (&used + &request).exceeding_dimensions(&runtime);
        if !exceeded.is_empty() {
            let exceeded = format_dimensions(&exceeded);
            return Ok(Verdict::Unschedulable(format!(
                "Insufficient quota: exceedDimensions: {exceeded} runtime={runtime:?} used={used:?} request={request:?}"
            )));
        }
    }

    if is_non_preemptible(pod) {
        let min = quota.min();
        let non_preemptible_used = quota.non_preemptible_used();
        let exceeded = (&non_preemptible_used + &request).exceeding_dimensions(&min);
        if !exceeded.is_empty() {
            let exceeded = format_dimensions(&exceeded);
            return Ok(Verdict::Unschedulable(format!(
                "Insufficient non-preemptible quotas: exceedDimensions: {exceeded} min={min:?} nonPreemptibleUsed={non_preemptible_used:?} request={request:?}"
            )));
        }
    }

    if config.enable_check_parent_quota {
        let mut chain = vec![quota_name.clone()];
        for ancestor in manager.topology().ancestor_chain(&quota_name) {
            chain.push(ancestor.name.clone());
            let runtime = manager.refresh_runtime(&ancestor.name).unwrap_or_else(ResourceAmount::zero);
            let used = ancestor.used();
            let exceeded = (&used + &request).exceeding_dimensions(&runtime);
            if !exceeded.is_empty() {
                chain.reverse();
                let exceeded = format_dimensions(&exceeded);
                return Ok(Verdict::Unschedulable(format!(
                    "Insufficient quota along ancestor chain {chain:?}: exceedDimensions: {exceeded} runtime={runtime:?} used={used:?} request={request:?}"
                )));
            }
        }
    }

    cycle_state.set_snapshot(CycleQuotaSnapshot {
        quota_name,
        runtime: quota.runtime(),
        used: quota.used(),
        non_preemptible_used: quota.non_preemptible_used(),
    });

    Ok(Verdict::Success)
}

/// Marks the pod assigned in its group's pod cache so it counts toward
/// `Used` regardless of reported phase.
pub fn reserve(registry: &QuotaManagerRegistry, pod: &Pod) -> PluginResult<()> {
    let quota_name = resolve_quota_name(pod, registry);
    if let Some(manager) = registry.manager_of(&quota_name) {
        manager.set_pod_assigned(&quota_name, &pod_uid(pod), true);
    }
    Ok(())
}

/// Reverses [`reserve`]; must leave aggregates exactly as before `Reserve`.
pub fn unreserve(registry: &QuotaManagerRegistry, pod: &Pod) -> PluginResult<()> {
    let quota_name = resolve_quota_name(pod, registry);
    if let Some(manager) = registry.manager_of(&quota_name) {
        manager.set_pod_assigned(&quota_name, &pod_uid(pod), false);
    }
    Ok(())
}

/// Adjusts the cycle-local snapshot's `used` for a hypothetical nominated
/// pod. Never touches tree state.
pub fn add_pod(cycle_state: &mut CycleState, request: &ResourceAmount) {
    cycle_state.add_pod(request);
}

/// Adjusts the cycle-local snapshot's `used` for a hypothetical preemption
/// victim. Never touches tree state.
pub fn remove_pod(cycle_state: &mut CycleState, request: &ResourceAmount) {
    cycle_state.remove_pod(request);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::{Container, PodSpec, ResourceRequirements},
        apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
    };
    use quota_core::topology::QuotaSpecInput;

    use super::*;

    fn pod(namespace: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                uid: Some("uid-1".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    fn pod_requesting(namespace: &str, cpu_millis: &str, memory_bytes: &str) -> Pod {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(cpu_millis.to_string()));
        requests.insert("memory".to_string(), Quantity(memory_bytes.to_string()));
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                uid: Some("uid-1".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    fn registry_with_group(name: &str, min: (i64, i64), max: (i64, i64)) -> QuotaManagerRegistry {
        let registry = QuotaManagerRegistry::new(true, true);
        registry
            .add_quota(QuotaSpecInput {
                name: name.to_string(),
                parent_name: None,
                tree_id: None,
                is_parent: false,
                max: ResourceAmount::cpu_mem(max.0, max.1),
                min: ResourceAmount::cpu_mem(min.0, min.1),
                shared_weight: None,
                allow_lent_resource: true,
                namespaces: vec!["ns".to_string()],
            })
            .unwrap();
        registry.manager_for(None).update_cluster_total_resource(ResourceAmount::cpu_mem(max.0, max.1));
        registry
    }

    #[test]
    fn scenario_s4_denial_lists_exceeding_dimension() {
        let registry = registry_with_group("default", (0, 0), (0, 20));
        let mut cycle_state = CycleState::default();
        let config = PluginConfig::default();

        let verdict = pre_filter(
            &registry,
            &config,
            &pod_requesting("ns-without-binding", "1m", "2"),
            &mut cycle_state,
        )
        .unwrap();
        match verdict {
            Verdict::Unschedulable(message) => {
                assert!(message.contains("exceedDimensions: [cpu]"), "message was: {message}");
            }
            Verdict::Success => panic!("expected denial"),
        }
    }

    #[test]
    fn reserve_then_unreserve_leaves_aggregates_unchanged() {
        let registry = registry_with_group("ns", (10, 10), (20, 20));
        let p = pod("ns");
        crate::events::on_pod_add(&registry, &p).unwrap();

        let before = registry.get_quota_info("ns").unwrap().snapshot();
        reserve(&registry, &p).unwrap();
        unreserve(&registry, &p).unwrap();
        let after = registry.get_quota_info("ns").unwrap().snapshot();

        assert_eq!(before.used, after.used);
    }
}
