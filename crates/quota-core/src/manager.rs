//! Owns one quota tree and its cluster-total resource vector: quota
//! structural operations (delegated to [`QuotaTopology`]), pod accounting
//! propagated up the parent chain, and the weighted max-min fair share
//! runtime calculator (spec.md §4.2).

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use crate::{
    constants::ROOT,
    error::TopologyResult,
    pod::{CachedPod, PodUid},
    quota_info::QuotaInfo,
    resources::{Dimension, ResourceAmount},
    topology::{QuotaSpecInput, QuotaTopology},
};

/// One child's inputs to the progressive-filling loop for a single
/// dimension: its still-unsatisfied demand above its own guarantee, and its
/// sharing weight.
struct DemandEntry {
    name: String,
    demand: i64,
    weight: i64,
}

/// Distributes `rem` among `pool` in proportion to weight, capped per-child
/// by its remaining demand, repeating until either every child is saturated
/// or `rem` reaches zero. Children are assumed pre-sorted by name so ties
/// resolve deterministically.
fn progressive_fill(mut rem: i64, mut pool: Vec<DemandEntry>) -> BTreeMap<String, i64> {
    let mut allocated: BTreeMap<String, i64> = BTreeMap::new();
    loop {
        pool.retain(|c| c.demand > 0);
        if pool.is_empty() || rem <= 0 {
            break;
        }
        let weight_sum: i64 = pool.iter().map(|c| c.weight).sum();
        if weight_sum <= 0 {
            break;
        }
        let mut given_this_round = 0i64;
        for child in &mut pool {
            let share = ((rem as i128) * (child.weight as i128) / (weight_sum as i128)) as i64;
            let give = share.min(child.demand);
            if give <= 0 {
                continue;
            }
            *allocated.entry(child.name.clone()).or_insert(0) += give;
            child.demand -= give;
            given_this_round += give;
        }
        rem -= given_this_round;
        if given_this_round == 0 {
            // Integer rounding starved every child this round (rem too
            // small relative to weight_sum); no further progress possible.
            break;
        }
    }
    allocated
}

/// A group's inputs to the runtime calculation on one dimension.
struct ChildSnapshot {
    name: String,
    min: ResourceAmount,
    max: ResourceAmount,
    request: ResourceAmount,
    weight: ResourceAmount,
    allow_lent_resource: bool,
}

/// Computes each child's Runtime vector given the parent's available
/// capacity, per spec.md §4.2 steps 1-7.
fn compute_children_runtime(
    capacity: &ResourceAmount,
    children: &[Arc<QuotaInfo>],
) -> BTreeMap<String, ResourceAmount> {
    let mut snaps: Vec<ChildSnapshot> = children
        .iter()
        .map(|c| {
            let s = c.snapshot();
            ChildSnapshot {
                name: s.name,
                min: s.min,
                max: s.max,
                request: s.request,
                weight: s.shared_weight,
                allow_lent_resource: s.allow_lent_resource,
            }
        })
        .collect();
    snaps.sort_by(|a, b| a.name.cmp(&b.name));

    let mut dims = vec![Dimension::Cpu, Dimension::Memory];
    for snap in &snaps {
        for dim in ResourceAmount::dimensions_union(&snap.max, &snap.request) {
            if !dims.contains(&dim) {
                dims.push(dim);
            }
        }
    }

    let mut result: BTreeMap<String, ResourceAmount> =
        snaps.iter().map(|s| (s.name.clone(), ResourceAmount::zero())).collect();

    for dim in dims {
        let capacity_d = capacity.get(&dim);

        let mut guaranteed: BTreeMap<String, i64> = BTreeMap::new();
        let mut reserved_floor_sum: i64 = 0;
        let mut demand_pool = Vec::new();

        for snap in &snaps {
            let min_d = snap.min.get(&dim);
            let max_d = snap.max.get(&dim);
            let request_d = snap.request.get(&dim);

            let g = min_d.min(request_d).max(0);
            guaranteed.insert(snap.name.clone(), g);

            let floor = if snap.allow_lent_resource { g } else { min_d };
            reserved_floor_sum += floor;

            let demand = (max_d.min(request_d) - g).max(0);
            if demand > 0 {
                demand_pool.push(DemandEntry {
                    name: snap.name.clone(),
                    demand,
                    weight: snap.weight.get(&dim).max(0),
                });
            }
        }

        let rem = (capacity_d - reserved_floor_sum).max(0);
        let extra = progressive_fill(rem, demand_pool);

        for snap in &snaps {
            let g = guaranteed.get(&snap.name).copied().unwrap_or(0);
            let e = extra.get(&snap.name).copied().unwrap_or(0);
            let max_d = snap.max.get(&dim);
            let runtime_d = (g + e).min(max_d);
            result.get_mut(&snap.name).expect("inserted above").set(&dim, runtime_d);
        }
    }

    result
}

/// Owns one quota tree (identified by an optional tree id) and its
/// cluster-total resource pool.
pub struct GroupQuotaManager {
    pub tree_id: Option<String>,
    topology: QuotaTopology,
    cluster_total: RwLock<ResourceAmount>,
    /// Bumped on every structural change, request/used delta, or cluster
    /// total update. `RefreshRuntime` compares a group's cached
    /// `runtime_version` against this to decide whether recomputation is
    /// necessary (spec.md §9 "runtime cache coherence").
    generation: AtomicU64,
    enable_runtime_quota: std::sync::atomic::AtomicBool,
}

impl GroupQuotaManager {
    pub fn new(tree_id: Option<String>, strict_child_min: bool, enable_runtime_quota: bool) -> Self {
        Self {
            tree_id,
            topology: QuotaTopology::new(strict_child_min),
            cluster_total: RwLock::new(ResourceAmount::zero()),
            generation: AtomicU64::new(1),
            enable_runtime_quota: std::sync::atomic::AtomicBool::new(enable_runtime_quota),
        }
    }

    pub fn topology(&self) -> &QuotaTopology {
        &self.topology
    }

    pub fn set_enable_runtime_quota(&self, enabled: bool) {
        self.enable_runtime_quota.store(enabled, Ordering::SeqCst);
        self.mark_dirty();
    }

    fn enable_runtime_quota(&self) -> bool {
        self.enable_runtime_quota.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Sets the resource pool available to the root fan-out. The actual
    /// redistribution is recomputed lazily on the next `RefreshRuntime`.
    pub fn update_cluster_total_resource(&self, total: ResourceAmount) {
        *self.cluster_total.write().unwrap_or_else(std::sync::PoisonError::into_inner) = total;
        self.mark_dirty();
    }

    pub fn cluster_total_resource(&self) -> ResourceAmount {
        self.cluster_total.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn add_quota(&self, input: QuotaSpecInput) -> TopologyResult<Arc<QuotaInfo>> {
        let group = self.topology.add(input)?;
        self.mark_dirty();
        Ok(group)
    }

    /// Materializes `"system"`/`"default"` on cold start if a prior run
    /// never created them. See [`QuotaTopology::ensure_reserved`].
    pub fn ensure_reserved_quota(&self, name: &str, max: ResourceAmount) -> Arc<QuotaInfo> {
        let group = self.topology.ensure_reserved(name, max);
        self.mark_dirty();
        group
    }

    /// Applies a structural update, migrating the moved group's whole-subtree
    /// accounting contribution from the old ancestor chain to the new one
    /// when it was reparented (spec.md §8 invariant 7 / scenario S2).
    pub fn update_quota(
        &self,
        input: QuotaSpecInput,
        old_namespaces: &[String],
    ) -> TopologyResult<Arc<QuotaInfo>> {
        let old_chain = self.topology.ancestor_chain(&input.name);
        let old_parent = self.topology.get(&input.name).map(|g| g.parent_name());

        let group = self.topology.update(input, old_namespaces)?;
        let new_parent = group.parent_name();

        if old_parent.as_deref() != Some(new_parent.as_str()) {
            let snap = group.snapshot();
            for ancestor in &old_chain {
                apply_delta_or_log(
                    ancestor,
                    &negate(&snap.request),
                    &negate(&snap.used),
                    &negate(&snap.non_preemptible_request),
                    &negate(&snap.non_preemptible_used),
                );
            }
            let new_chain = self.topology.ancestor_chain(&group.name);
            for ancestor in &new_chain {
                apply_delta_or_log(
                    ancestor,
                    &snap.request,
                    &snap.used,
                    &snap.non_preemptible_request,
                    &snap.non_preemptible_used,
                );
            }
        }

        self.mark_dirty();
        Ok(group)
    }

    pub fn delete_quota(&self, name: &str) -> TopologyResult<()> {
        self.topology.delete(name)?;
        self.mark_dirty();
        Ok(())
    }

    /// Adds a pod to `quota`'s pod cache and propagates its request (and,
    /// when bound/running, its used) up the parent chain. Re-adding a uid
    /// already in the cache (a re-list from the informer layer, or recovery
    /// re-applying the same snapshot) replaces its cached contribution
    /// rather than doubling it: only the delta between the old and new
    /// contribution is propagated, which is zero when the resubmitted pod
    /// is unchanged.
    pub fn add_pod(&self, quota_name: &str, uid: PodUid, pod: CachedPod) {
        let Some(quota) = self.topology.get(quota_name) else {
            tracing::warn!(quota_name, "add_pod: unknown quota group, dropping event");
            return;
        };
        let (old_request, old_used, old_npr, old_npu) = quota
            .get_pod(&uid)
            .map(|existing| contribution_of(&existing))
            .unwrap_or_default();
        let (new_request, new_used, new_npr, new_npu) = contribution_of(&pod);

        quota.insert_pod(uid, pod);
        self.propagate_delta(
            quota_name,
            &(&new_request - &old_request),
            &(&new_used - &old_used),
            &(&new_npr - &old_npr),
            &(&new_npu - &old_npu),
        );
        self.mark_dirty();
    }

    /// Removes a pod from `quota`'s pod cache, reversing whatever it had
    /// been contributing.
    pub fn remove_pod(&self, quota_name: &str, uid: &PodUid) {
        let Some(quota) = self.topology.get(quota_name) else {
            tracing::warn!(quota_name, "remove_pod: unknown quota group, dropping event");
            return;
        };
        let Some(pod) = quota.remove_pod(uid) else {
            tracing::debug!(quota_name, %uid, "remove_pod: pod was not cached, ignoring");
            return;
        };
        let request_delta = negate(&pod.request);
        let used_delta = if pod.counts_as_used() { negate(&pod.request) } else { ResourceAmount::zero() };
        let (npr_delta, npu_delta) = if pod.is_non_preemptible {
            (request_delta.clone(), used_delta.clone())
        } else {
            (ResourceAmount::zero(), ResourceAmount::zero())
        };

        self.propagate_delta(quota_name, &request_delta, &used_delta, &npr_delta, &npu_delta);
        self.mark_dirty();
    }

    /// Applies a pod's request change in place (spec.md §4.3 `OnPodUpdate`
    /// when the pod's resolved quota name is unchanged).
    pub fn update_pod_request(&self, quota_name: &str, uid: &PodUid, new_request: ResourceAmount) {
        let Some(quota) = self.topology.get(quota_name) else {
            tracing::warn!(quota_name, "update_pod_request: unknown quota group, dropping event");
            return;
        };
        let Some(mut pod) = quota.get_pod(uid) else {
            tracing::debug!(quota_name, %uid, "update_pod_request: pod was not cached, ignoring");
            return;
        };
        let old_request = pod.request.clone();
        let request_delta = &new_request - &old_request;
        let used_delta = if pod.counts_as_used() { request_delta.clone() } else { ResourceAmount::zero() };
        let (npr_delta, npu_delta) = if pod.is_non_preemptible {
            (request_delta.clone(), used_delta.clone())
        } else {
            (ResourceAmount::zero(), ResourceAmount::zero())
        };

        pod.request = new_request;
        quota.insert_pod(uid.clone(), pod);
        self.propagate_delta(quota_name, &request_delta, &used_delta, &npr_delta, &npu_delta);
        self.mark_dirty();
    }

    /// Marks a cached pod assigned (Reserve) or unassigned (Unreserve),
    /// adjusting `Used` without touching `Request`.
    pub fn set_pod_assigned(&self, quota_name: &str, uid: &PodUid, assigned: bool) {
        let Some(quota) = self.topology.get(quota_name) else {
            tracing::warn!(quota_name, "set_pod_assigned: unknown quota group, dropping event");
            return;
        };
        let Some(mut pod) = quota.get_pod(uid) else {
            tracing::debug!(quota_name, %uid, "set_pod_assigned: pod was not cached, ignoring");
            return;
        };
        let was_used = pod.counts_as_used();
        pod.is_assigned = assigned;
        let is_used_now = pod.counts_as_used();
        let request = pod.request.clone();
        let is_non_preemptible = pod.is_non_preemptible;
        quota.insert_pod(uid.clone(), pod);

        if was_used != is_used_now {
            let used_delta = if is_used_now { request.clone() } else { negate(&request) };
            let npu_delta = if is_non_preemptible { used_delta.clone() } else { ResourceAmount::zero() };
            self.propagate_delta(quota_name, &ResourceAmount::zero(), &used_delta, &ResourceAmount::zero(), &npu_delta);
            self.mark_dirty();
        }
    }

    fn propagate_delta(
        &self,
        quota_name: &str,
        request_delta: &ResourceAmount,
        used_delta: &ResourceAmount,
        npr_delta: &ResourceAmount,
        npu_delta: &ResourceAmount,
    ) {
        let Some(quota) = self.topology.get(quota_name) else {
            return;
        };
        apply_delta_or_log(&quota, request_delta, used_delta, npr_delta, npu_delta);
        for ancestor in self.topology.ancestor_chain(quota_name) {
            apply_delta_or_log(&ancestor, request_delta, used_delta, npr_delta, npu_delta);
        }
    }

    pub fn get_quota_info(&self, name: &str) -> Option<Arc<QuotaInfo>> {
        self.topology.get(name)
    }

    /// Recomputes Runtime for `name` (and the whole tree it belongs to, see
    /// module docs) if stale, then returns its current value. `None` if the
    /// group does not exist.
    pub fn refresh_runtime(&self, name: &str) -> Option<ResourceAmount> {
        let group = self.topology.get(name)?;
        let target_generation = self.generation.load(Ordering::SeqCst);
        if group.runtime_version() != target_generation {
            let cluster_total = self.cluster_total_resource();
            self.recompute_subtree(ROOT, cluster_total, target_generation);
        }
        Some(group.runtime())
    }

    fn recompute_subtree(&self, parent_name: &str, capacity: ResourceAmount, generation: u64) {
        let children = self.topology.children_of(parent_name);
        if children.is_empty() {
            return;
        }

        let runtimes: BTreeMap<String, ResourceAmount> = if self.enable_runtime_quota() {
            compute_children_runtime(&capacity, &children)
        } else {
            children.iter().map(|c| (c.name.clone(), c.max())).collect()
        };

        for child in &children {
            let runtime = runtimes.get(&child.name).cloned().unwrap_or_else(ResourceAmount::zero);
            child.set_runtime(runtime.clone(), generation);
            self.recompute_subtree(&child.name, runtime, generation);
        }
    }
}

/// Applies an accounting delta, logging and dropping it on the
/// [`AccountingError`] this group's `apply_delta` reports if the delta would
/// desynchronize its aggregates. Never propagated: an internal
/// inconsistency here cannot be fixed by failing the caller's request.
fn apply_delta_or_log(
    quota: &QuotaInfo,
    request_delta: &ResourceAmount,
    used_delta: &ResourceAmount,
    npr_delta: &ResourceAmount,
    npu_delta: &ResourceAmount,
) {
    if let Err(error) = quota.apply_delta(request_delta, used_delta, npr_delta, npu_delta) {
        error.log();
    }
}

fn negate(a: &ResourceAmount) -> ResourceAmount {
    ResourceAmount {
        cpu_millis: -a.cpu_millis,
        memory_bytes: -a.memory_bytes,
        extended: a.extended.iter().map(|(k, v)| (k.clone(), -v)).collect(),
    }
}

/// A cached pod's (request, used, non-preemptible request, non-preemptible
/// used) contribution to its group's aggregates.
fn contribution_of(pod: &CachedPod) -> (ResourceAmount, ResourceAmount, ResourceAmount, ResourceAmount) {
    let request = pod.request.clone();
    let used = if pod.counts_as_used() { request.clone() } else { ResourceAmount::zero() };
    let (npr, npu) = if pod.is_non_preemptible {
        (request.clone(), used.clone())
    } else {
        (ResourceAmount::zero(), ResourceAmount::zero())
    };
    (request, used, npr, npu)
}
