//! Cold-start recovery: rebuild the whole in-memory tree from the
//! informer layer's caches after a restart, since nothing here is
//! persisted (spec.md §4.4, §9 "process restart").
//!
//! Quotas are applied before pods so every pod's resolved group already
//! exists by the time its request is propagated. `default` and `system` are
//! created first of all if a prior run never created them, so namespace
//! resolution and the system-critical fallback always have somewhere to
//! land.

use quota_core::{constants::{DEFAULT, SYSTEM}, registry::QuotaManagerRegistry};

use crate::{cluster_view::ClusterView, config::PluginConfig, error::PluginResult, events};

/// Runs the full recovery sequence against `view`. Idempotent: safe to call
/// again (e.g. after a watch resync) since re-adding an unchanged quota or
/// pod is a no-op rather than an error or a doubled contribution — see
/// [`quota_core::topology::QuotaTopology::add`] and
/// [`quota_core::manager::GroupQuotaManager::add_pod`].
pub async fn recover(
    registry: &QuotaManagerRegistry,
    config: &PluginConfig,
    view: &dyn ClusterView,
) -> PluginResult<()> {
    registry.ensure_reserved_quota(SYSTEM, config.system_quota_group_max());
    registry.ensure_reserved_quota(DEFAULT, config.default_quota_group_max());

    for quota in view.list_quotas() {
        events::on_quota_add(registry, &quota)?;
        tokio::task::yield_now().await;
    }

    if registry.manager_for(None).cluster_total_resource().is_zero() {
        registry.manager_for(None).update_cluster_total_resource(view.node_capacity_total());
    }

    for pod in view.list_pods() {
        events::on_pod_add(registry, &pod)?;
        tokio::task::yield_now().await;
    }

    Ok(())
}
