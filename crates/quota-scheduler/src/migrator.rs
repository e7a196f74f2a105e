//! Background migration of the `default` group: a periodic task that
//! re-resolves every pod still parked there and, if its target has changed
//! (an `ElasticQuota`'s namespace binding or labels arrived after the pod
//! was first seen), moves it in one atomic remove/add pair (spec.md §4.3,
//! §5 "Concurrency model").

use std::{collections::HashMap, sync::Arc, time::Duration};

use quota_core::{constants::DEFAULT, pod::PodUid, registry::QuotaManagerRegistry};
use tokio::{sync::watch, time::Instant};

use crate::{cluster_view::ClusterView, config::PluginConfig, events};

/// Tracks, per pod still parked in `default`, the instant it first resolved
/// to a real target, so a pass can honor `delay_evict_time` instead of
/// migrating the moment a binding appears. Owned by the caller of
/// [`migrate_once`] across passes; [`run`] keeps one for its whole lifetime.
#[derive(Default)]
pub struct PendingMigrations {
    first_resolved_at: HashMap<PodUid, Instant>,
}

/// Runs one migration pass over every pod currently charged to `default`,
/// cooperatively yielding between pods so a large backlog doesn't starve
/// other tasks on the runtime. A pod only migrates once it has resolved to
/// the same non-`default` target for at least `delay_evict_time`, so a
/// binding that flaps doesn't churn admission state. Returns the number of
/// pods migrated.
pub async fn migrate_once(
    registry: &QuotaManagerRegistry,
    view: &dyn ClusterView,
    pending: &mut PendingMigrations,
    delay_evict_time: Duration,
) -> usize {
    let Some(default_manager) = registry.manager_of(DEFAULT) else {
        return 0;
    };
    let Some(default_quota) = default_manager.get_quota_info(DEFAULT) else {
        return 0;
    };

    let mut migrated = 0;
    for uid in default_quota.pod_uids() {
        let Some(pod) = view.get_pod(&uid) else {
            // Informer no longer has it; OnPodDelete will clean up the cache.
            pending.first_resolved_at.remove(&uid);
            continue;
        };
        let target = events::resolve_quota_name(&pod, registry);
        if target == DEFAULT {
            pending.first_resolved_at.remove(&uid);
            continue;
        }
        if registry.manager_of(&target).is_none() {
            // Resolved to a group that doesn't exist (yet); leave it in
            // `default` until the group shows up.
            pending.first_resolved_at.remove(&uid);
            continue;
        }

        let first_seen = *pending.first_resolved_at.entry(uid.clone()).or_insert_with(Instant::now);
        if first_seen.elapsed() < delay_evict_time {
            continue;
        }

        default_manager.remove_pod(DEFAULT, &uid);
        pending.first_resolved_at.remove(&uid);
        if let Err(error) = events::on_pod_add(registry, &pod) {
            tracing::warn!(%error, pod = %uid, target, "migrator: re-add after eviction from default failed");
        } else {
            migrated += 1;
            tracing::info!(pod = %uid, target, "migrator: moved pod out of default");
        }

        tokio::task::yield_now().await;
    }
    migrated
}

/// Runs [`migrate_once`] on `config.revoke_pod_interval` until `shutdown`
/// reports `true`, gating each pod on `config.delay_evict_time`. Mirrors the
/// informer layer's own run-loop shape: a `tokio::select!` between the
/// ticker and a watch channel, so the caller can request a clean stop
/// without the task polling for cancellation itself.
pub async fn run(
    registry: Arc<QuotaManagerRegistry>,
    view: Arc<dyn ClusterView>,
    config: PluginConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.revoke_pod_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending = PendingMigrations::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let moved = migrate_once(&registry, view.as_ref(), &mut pending, config.delay_evict_time).await;
                if moved > 0 {
                    tracing::debug!(moved, "migrator pass complete");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("migrator: shutdown signal received, stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use k8s_openapi::{
        api::core::v1::{Container, Pod, PodSpec, ResourceRequirements},
        apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
    };
    use quota_core::{
        constants::LABEL_QUOTA_NAME, resources::ResourceAmount, topology::QuotaSpecInput,
    };

    use super::*;

    struct FakeView {
        pods: Mutex<HashMap<String, Pod>>,
    }

    impl ClusterView for FakeView {
        fn list_quotas(&self) -> Vec<quota_core::crd::ElasticQuota> {
            vec![]
        }

        fn list_pods(&self) -> Vec<Pod> {
            self.pods.lock().unwrap_or_else(std::sync::PoisonError::into_inner).values().cloned().collect()
        }

        fn get_pod(&self, uid: &quota_core::pod::PodUid) -> Option<Pod> {
            self.pods.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&uid.0).cloned()
        }

        fn node_capacity_total(&self) -> ResourceAmount {
            ResourceAmount::zero()
        }
    }

    fn pod(uid: &str, quota_label: Option<&str>) -> Pod {
        let mut labels = std::collections::BTreeMap::new();
        if let Some(name) = quota_label {
            labels.insert(LABEL_QUOTA_NAME.to_string(), name.to_string());
        }
        let mut requests = std::collections::BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("100m".to_string()));
        requests.insert("memory".to_string(), Quantity("1Mi".to_string()));
        Pod {
            metadata: ObjectMeta {
                name: Some(uid.to_string()),
                uid: Some(uid.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(labels),
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

    #[tokio::test]
    async fn relabeled_pod_migrates_out_of_default() {
        let registry = QuotaManagerRegistry::new(true, true);
        registry
            .add_quota(QuotaSpecInput {
                name: DEFAULT.to_string(),
                parent_name: None,
                tree_id: None,
                is_parent: false,
                max: ResourceAmount::cpu_mem(1_000, 1_000_000_000),
                min: ResourceAmount::zero(),
                shared_weight: None,
                allow_lent_resource: true,
                namespaces: vec![],
            })
            .unwrap();
        registry
            .add_quota(QuotaSpecInput {
                name: "team-a".to_string(),
                parent_name: None,
                tree_id: None,
                is_parent: false,
                max: ResourceAmount::cpu_mem(1_000, 1_000_000_000),
                min: ResourceAmount::zero(),
                shared_weight: None,
                allow_lent_resource: true,
                namespaces: vec![],
            })
            .unwrap();

        let p = pod("p1", None);
        events::on_pod_add(&registry, &p).unwrap();
        assert_eq!(registry.get_quota_info(DEFAULT).unwrap().pod_count(), 1);

        let relabeled = pod("p1", Some("team-a"));
        let view = FakeView { pods: Mutex::new(HashMap::from([("p1".to_string(), relabeled)])) };

        let mut pending = PendingMigrations::default();
        let moved = migrate_once(&registry, &view, &mut pending, Duration::ZERO).await;
        assert_eq!(moved, 1);
        assert_eq!(registry.get_quota_info(DEFAULT).unwrap().pod_count(), 0);
        assert_eq!(registry.get_quota_info("team-a").unwrap().pod_count(), 1);
    }

    #[tokio::test]
    async fn pod_still_resolving_to_default_is_left_alone() {
        let registry = QuotaManagerRegistry::new(true, true);
        registry
            .add_quota(QuotaSpecInput {
                name: DEFAULT.to_string(),
                parent_name: None,
                tree_id: None,
                is_parent: false,
                max: ResourceAmount::cpu_mem(1_000, 1_000_000_000),
                min: ResourceAmount::zero(),
                shared_weight: None,
                allow_lent_resource: true,
                namespaces: vec![],
            })
            .unwrap();

        let p = pod("p1", None);
        events::on_pod_add(&registry, &p).unwrap();
        let view = FakeView { pods: Mutex::new(HashMap::from([("p1".to_string(), p)])) };

        let mut pending = PendingMigrations::default();
        let moved = migrate_once(&registry, &view, &mut pending, Duration::ZERO).await;
        assert_eq!(moved, 0);
        assert_eq!(registry.get_quota_info(DEFAULT).unwrap().pod_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relabeled_pod_waits_out_delay_evict_time_before_migrating() {
        let registry = QuotaManagerRegistry::new(true, true);
        registry
            .add_quota(QuotaSpecInput {
                name: DEFAULT.to_string(),
                parent_name: None,
                tree_id: None,
                is_parent: false,
                max: ResourceAmount::cpu_mem(1_000, 1_000_000_000),
                min: ResourceAmount::zero(),
                shared_weight: None,
                allow_lent_resource: true,
                namespaces: vec![],
            })
            .unwrap();
        registry
            .add_quota(QuotaSpecInput {
                name: "team-a".to_string(),
                parent_name: None,
                tree_id: None,
                is_parent: false,
                max: ResourceAmount::cpu_mem(1_000, 1_000_000_000),
                min: ResourceAmount::zero(),
                shared_weight: None,
                allow_lent_resource: true,
                namespaces: vec![],
            })
            .unwrap();

        let p = pod("p1", None);
        events::on_pod_add(&registry, &p).unwrap();
        let relabeled = pod("p1", Some("team-a"));
        let view = FakeView { pods: Mutex::new(HashMap::from([("p1".to_string(), relabeled)])) };

        let delay = Duration::from_secs(30);
        let mut pending = PendingMigrations::default();

        let moved = migrate_once(&registry, &view, &mut pending, delay).await;
        assert_eq!(moved, 0, "must not migrate before delay_evict_time elapses");
        assert_eq!(registry.get_quota_info(DEFAULT).unwrap().pod_count(), 1);

        tokio::time::advance(delay).await;

        let moved = migrate_once(&registry, &view, &mut pending, delay).await;
        assert_eq!(moved, 1, "must migrate once delay_evict_time has elapsed");
        assert_eq!(registry.get_quota_info(DEFAULT).unwrap().pod_count(), 0);
        assert_eq!(registry.get_quota_info("team-a").unwrap().pod_count(), 1);
    }
}
