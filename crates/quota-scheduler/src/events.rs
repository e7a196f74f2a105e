//! Event handlers driven by the informer layer: quota object and pod
//! lifecycle events, pod→quota resolution, and container request summation
//! (spec.md §4.3, §6).

use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use quota_core::{
    constants::{DEFAULT, LABEL_PREEMPTIBLE, LABEL_QUOTA_NAME, SYSTEM},
    crd::{parse_resource_list, ElasticQuota, QuotaAnnotations, QuotaLabels},
    pod::{CachedPod, PodPhase, PodUid},
    registry::QuotaManagerRegistry,
    resources::ResourceAmount,
    topology::QuotaSpecInput,
};
use snafu::ResultExt;

use crate::error::{InvalidResourceQuantitySnafu, PluginResult};

/// Resolves the quota group a pod is charged to, in priority order: the
/// explicit `quota-name` label, the namespace→quota binding, system-critical
/// pods, then the `default` catch-all (spec.md §4.3).
pub fn resolve_quota_name(pod: &Pod, registry: &QuotaManagerRegistry) -> String {
    if let Some(name) = pod.metadata.labels.as_ref().and_then(|l| l.get(LABEL_QUOTA_NAME)) {
        if registry.manager_of(name).is_some() {
            return name.clone();
        }
    }
    if let Some(namespace) = pod.metadata.namespace.as_deref() {
        if let Some(name) = registry.manager_for(None).topology().resolve_namespace(namespace) {
            return name;
        }
    }
    if is_system_critical(pod) {
        return SYSTEM.to_string();
    }
    DEFAULT.to_string()
}

fn is_system_critical(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let system_priority_class = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.priority_class_name.as_deref())
        .is_some_and(|class| class == "system-node-critical" || class == "system-cluster-critical");
    owned_by_daemonset || system_priority_class
}

pub fn is_non_preemptible(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_PREEMPTIBLE))
        .is_some_and(|v| v == "false")
}

fn container_request(container: &Container, subject: &str) -> PluginResult<ResourceAmount> {
    let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) else {
        return Ok(ResourceAmount::zero());
    };
    parse_resource_list(requests).context(InvalidResourceQuantitySnafu { subject: subject.to_string() })
}

/// Sums regular containers' requests; init containers contribute their
/// per-dimension maximum, not their sum, since they never run concurrently
/// with each other or with the regular containers (spec.md §6).
pub fn pod_total_request(pod: &Pod) -> PluginResult<ResourceAmount> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(ResourceAmount::zero());
    };
    let subject = pod.name_any();

    let mut total = ResourceAmount::zero();
    for container in &spec.containers {
        total += &container_request(container, &subject)?;
    }

    let mut init_max = ResourceAmount::zero();
    for container in spec.init_containers.as_deref().unwrap_or_default() {
        let request = container_request(container, &subject)?;
        init_max = init_max.max_per_dim(&request);
    }
    total += &init_max;

    Ok(total)
}

pub(crate) fn pod_uid(pod: &Pod) -> PodUid {
    PodUid(pod.metadata.uid.clone().unwrap_or_else(|| pod.name_any()))
}

fn quota_spec_input(quota: &ElasticQuota) -> PluginResult<(QuotaSpecInput, QuotaLabels, QuotaAnnotations)> {
    let name = quota.name_any();
    let labels = QuotaLabels::from_map(quota.labels());
    let annotations = QuotaAnnotations::from_map(quota.annotations());

    let max = parse_resource_list(&quota.spec.max)
        .context(InvalidResourceQuantitySnafu { subject: format!("quota {name:?} max") })?;
    let min = parse_resource_list(&quota.spec.min)
        .context(InvalidResourceQuantitySnafu { subject: format!("quota {name:?} min") })?;
    let shared_weight = annotations
        .shared_weight
        .as_ref()
        .map(parse_resource_list)
        .transpose()
        .context(InvalidResourceQuantitySnafu { subject: format!("quota {name:?} shared-weight") })?;

    let input = QuotaSpecInput {
        name,
        parent_name: labels.parent.clone(),
        tree_id: labels.tree_id.clone(),
        is_parent: labels.is_parent,
        max,
        min,
        shared_weight,
        allow_lent_resource: true,
        namespaces: annotations.namespaces.clone(),
    };
    Ok((input, labels, annotations))
}

/// `OnQuotaAdd`: ignores tombstones, fills defaults, validates and inserts,
/// then seeds the tree's cluster total if this quota is root-flagged.
pub fn on_quota_add(registry: &QuotaManagerRegistry, quota: &ElasticQuota) -> PluginResult<()> {
    if quota.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }
    let (input, labels, annotations) = quota_spec_input(quota)?;
    let name = input.name.clone();
    registry.add_quota(input)?;

    if labels.is_root {
        if let Some(total) = &annotations.total_resource {
            let total_amount = parse_resource_list(total)
                .context(InvalidResourceQuantitySnafu { subject: format!("quota {name:?} total-resource") })?;
            registry.set_cluster_total(labels.tree_id.as_deref(), total_amount);
        }
    }
    Ok(())
}

/// `OnQuotaUpdate`: routes to delete when a tombstone appears, otherwise
/// re-validates and applies (including reparenting).
pub fn on_quota_update(
    registry: &QuotaManagerRegistry,
    old: &ElasticQuota,
    new: &ElasticQuota,
) -> PluginResult<()> {
    if new.resource_version() == old.resource_version() {
        return Ok(());
    }
    if new.metadata.deletion_timestamp.is_some() {
        return on_quota_delete(registry, new);
    }
    let old_annotations = QuotaAnnotations::from_map(old.annotations());
    let (input, labels, annotations) = quota_spec_input(new)?;
    let name = input.name.clone();
    registry.update_quota(input, &old_annotations.namespaces)?;

    if labels.is_root {
        if let Some(total) = &annotations.total_resource {
            let total_amount = parse_resource_list(total)
                .context(InvalidResourceQuantitySnafu { subject: format!("quota {name:?} total-resource") })?;
            registry.set_cluster_total(labels.tree_id.as_deref(), total_amount);
        }
    }
    Ok(())
}

pub fn on_quota_delete(registry: &QuotaManagerRegistry, quota: &ElasticQuota) -> PluginResult<()> {
    Ok(registry.delete_quota(&quota.name_any())?)
}

/// `OnPodAdd`: resolves the pod's group, inserts it into that group's pod
/// cache, and propagates its request (and used, if already bound/running) up
/// the parent chain.
pub fn on_pod_add(registry: &QuotaManagerRegistry, pod: &Pod) -> PluginResult<()> {
    let quota_name = resolve_quota_name(pod, registry);
    let Some(manager) = registry.manager_of(&quota_name) else {
        return Ok(());
    };
    let request = pod_total_request(pod)?;
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(pod_phase_from_str)
        .unwrap_or_default();
    let cached = CachedPod::new(request, phase, is_non_preemptible(pod));
    manager.add_pod(&quota_name, pod_uid(pod), cached);
    Ok(())
}

/// `OnPodUpdate`: a changed resolved group migrates the pod wholesale;
/// otherwise only the request delta is applied.
pub fn on_pod_update(registry: &QuotaManagerRegistry, old: &Pod, new: &Pod) -> PluginResult<()> {
    let old_quota_name = resolve_quota_name(old, registry);
    let new_quota_name = resolve_quota_name(new, registry);
    let uid = pod_uid(new);

    if old_quota_name != new_quota_name {
        if let Some(old_manager) = registry.manager_of(&old_quota_name) {
            old_manager.remove_pod(&old_quota_name, &uid);
        }
        return on_pod_add(registry, new);
    }

    let Some(manager) = registry.manager_of(&new_quota_name) else {
        return Ok(());
    };
    let new_request = pod_total_request(new)?;
    manager.update_pod_request(&new_quota_name, &uid, new_request);
    Ok(())
}

pub fn on_pod_delete(registry: &QuotaManagerRegistry, pod: &Pod) -> PluginResult<()> {
    let quota_name = resolve_quota_name(pod, registry);
    if let Some(manager) = registry.manager_of(&quota_name) {
        manager.remove_pod(&quota_name, &pod_uid(pod));
    }
    Ok(())
}

fn pod_phase_from_str(phase: &str) -> PodPhase {
    match phase {
        "Pending" => PodPhase::Pending,
        "Running" => PodPhase::Running,
        "Succeeded" => PodPhase::Succeeded,
        "Failed" => PodPhase::Failed,
        _ => PodPhase::Unknown,
    }
}
