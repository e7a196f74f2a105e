//! `QuotaPlugin`: the fixed capability set a scheduler framework calls into
//! (spec.md §4.3, §9). Kept as one struct with inherent methods rather than
//! a trait implemented per hook — the set of hooks is closed, and nothing
//! in this engine benefits from being called through a trait object.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use quota_core::{crd::ElasticQuota, registry::QuotaManagerRegistry, resources::ResourceAmount};

use crate::{
    admission::{self, Verdict},
    config::PluginConfig,
    cluster_view::ClusterView,
    cycle_state::CycleState,
    error::PluginResult,
    events, recovery,
};

/// Holds the one piece of process-wide state (the [`QuotaManagerRegistry`])
/// plus the static configuration, and exposes every hook the scheduler
/// framework drives this plugin through.
pub struct QuotaPlugin {
    registry: Arc<QuotaManagerRegistry>,
    config: PluginConfig,
}

impl QuotaPlugin {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            registry: Arc::new(QuotaManagerRegistry::new(config.strict_child_min, config.enable_runtime_quota)),
            config,
        }
    }

    pub fn name() -> &'static str {
        "ElasticQuota"
    }

    pub fn registry(&self) -> &Arc<QuotaManagerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Cold-start recovery: rebuilds the whole tree from `view` before the
    /// plugin starts taking live events.
    #[tracing::instrument(skip_all)]
    pub async fn recover(&self, view: &dyn ClusterView) -> PluginResult<()> {
        recovery::recover(&self.registry, &self.config, view).await
    }

    #[tracing::instrument(skip_all, fields(quota = quota.metadata.name.as_deref()))]
    pub fn on_quota_add(&self, quota: &ElasticQuota) -> PluginResult<()> {
        events::on_quota_add(&self.registry, quota)
    }

    #[tracing::instrument(skip_all, fields(quota = new.metadata.name.as_deref()))]
    pub fn on_quota_update(&self, old: &ElasticQuota, new: &ElasticQuota) -> PluginResult<()> {
        events::on_quota_update(&self.registry, old, new)
    }

    #[tracing::instrument(skip_all, fields(quota = quota.metadata.name.as_deref()))]
    pub fn on_quota_delete(&self, quota: &ElasticQuota) -> PluginResult<()> {
        events::on_quota_delete(&self.registry, quota)
    }

    #[tracing::instrument(skip_all, fields(pod = pod.metadata.name.as_deref()))]
    pub fn on_pod_add(&self, pod: &Pod) -> PluginResult<()> {
        events::on_pod_add(&self.registry, pod)
    }

    #[tracing::instrument(skip_all, fields(pod = new.metadata.name.as_deref()))]
    pub fn on_pod_update(&self, old: &Pod, new: &Pod) -> PluginResult<()> {
        events::on_pod_update(&self.registry, old, new)
    }

    #[tracing::instrument(skip_all, fields(pod = pod.metadata.name.as_deref()))]
    pub fn on_pod_delete(&self, pod: &Pod) -> PluginResult<()> {
        events::on_pod_delete(&self.registry, pod)
    }

    #[tracing::instrument(skip_all, fields(pod = pod.metadata.name.as_deref()))]
    pub fn pre_filter(&self, pod: &Pod, cycle_state: &mut CycleState) -> PluginResult<Verdict> {
        admission::pre_filter(&self.registry, &self.config, pod, cycle_state)
    }

    pub fn add_pod(&self, cycle_state: &mut CycleState, request: &ResourceAmount) {
        admission::add_pod(cycle_state, request);
    }

    pub fn remove_pod(&self, cycle_state: &mut CycleState, request: &ResourceAmount) {
        admission::remove_pod(cycle_state, request);
    }

    #[tracing::instrument(skip_all, fields(pod = pod.metadata.name.as_deref()))]
    pub fn reserve(&self, pod: &Pod) -> PluginResult<()> {
        admission::reserve(&self.registry, pod)
    }

    #[tracing::instrument(skip_all, fields(pod = pod.metadata.name.as_deref()))]
    pub fn unreserve(&self, pod: &Pod) -> PluginResult<()> {
        admission::unreserve(&self.registry, pod)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use quota_core::topology::QuotaSpecInput;

    use super::*;

    fn pod(name: &str, namespace: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    #[test]
    fn plugin_name_is_stable() {
        assert_eq!(QuotaPlugin::name(), "ElasticQuota");
    }

    #[test]
    fn full_admission_round_trip_through_the_plugin() {
        let plugin = QuotaPlugin::new(PluginConfig::default());
        plugin
            .registry()
            .add_quota(QuotaSpecInput {
                name: "team-a".to_string(),
                parent_name: None,
                tree_id: None,
                is_parent: false,
                max: ResourceAmount::cpu_mem(1_000, 1_000_000_000),
                min: ResourceAmount::zero(),
                shared_weight: None,
                allow_lent_resource: true,
                namespaces: vec!["ns-a".to_string()],
            })
            .unwrap();
        plugin.registry().manager_for(None).update_cluster_total_resource(ResourceAmount::cpu_mem(1_000, 1_000_000_000));

        let p = pod("p1", "ns-a");
        let mut cycle_state = CycleState::default();

        let verdict = plugin.pre_filter(&p, &mut cycle_state).unwrap();
        assert_eq!(verdict, Verdict::Success);

        plugin.on_pod_add(&p).unwrap();
        plugin.reserve(&p).unwrap();
        assert_eq!(plugin.registry().get_quota_info("team-a").unwrap().pod_count(), 1);

        plugin.unreserve(&p).unwrap();
        plugin.on_pod_delete(&p).unwrap();
        assert_eq!(plugin.registry().get_quota_info("team-a").unwrap().pod_count(), 0);
    }
}
