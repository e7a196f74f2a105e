//! Per-group quota state: the guarantees (`Min`/`Max`/`SharedWeight`), the
//! aggregated accounting counters, the runtime share, and the pod cache.
//!
//! Each [`QuotaInfo`] owns its own lock (spec.md §5) so that a request/used
//! delta on one group never blocks a reader of a sibling. Callers acquire at
//! most one `QuotaInfo` lock at a time — [`crate::manager::GroupQuotaManager`]
//! walks the parent chain one group at a time, dropping each guard before
//! taking the next, which makes the ancestor-before-descendant ordering rule
//! trivially satisfied rather than something a caller must remember to honor.

use std::{
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    error::{AccountingError, AccountingSnafu},
    pod::{CachedPod, PodUid},
    resources::ResourceAmount,
};

/// A read-only copy of a group's counters, useful whenever a caller needs a
/// consistent view without holding the lock across further work (e.g.
/// building a PreFilter denial message).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaInfoSnapshot {
    pub name: String,
    pub parent_name: String,
    pub tree_id: Option<String>,
    pub is_parent: bool,
    pub max: ResourceAmount,
    pub min: ResourceAmount,
    pub shared_weight: ResourceAmount,
    pub allow_lent_resource: bool,
    pub request: ResourceAmount,
    pub used: ResourceAmount,
    pub non_preemptible_request: ResourceAmount,
    pub non_preemptible_used: ResourceAmount,
    pub runtime: ResourceAmount,
    pub allocated_resource: ResourceAmount,
    pub pod_count: usize,
    pub runtime_version: u64,
}

struct QuotaInfoInner {
    parent_name: String,
    tree_id: Option<String>,
    is_parent: bool,
    max: ResourceAmount,
    min: ResourceAmount,
    shared_weight: ResourceAmount,
    allow_lent_resource: bool,
    request: ResourceAmount,
    used: ResourceAmount,
    non_preemptible_request: ResourceAmount,
    non_preemptible_used: ResourceAmount,
    runtime: ResourceAmount,
    allocated_resource: ResourceAmount,
    pod_cache: BTreeMap<PodUid, CachedPod>,
    runtime_version: u64,
}

/// One node in the quota tree. Identity (`name`) is immutable; everything
/// else lives behind this group's own lock.
pub struct QuotaInfo {
    pub name: String,
    inner: RwLock<QuotaInfoInner>,
}

/// Fields supplied when a group is first created, after `FillDefaults` has
/// run (spec.md §4.1).
pub struct NewQuotaInfo {
    pub name: String,
    pub parent_name: String,
    pub tree_id: Option<String>,
    pub is_parent: bool,
    pub max: ResourceAmount,
    pub min: ResourceAmount,
    pub shared_weight: ResourceAmount,
    pub allow_lent_resource: bool,
}

impl QuotaInfo {
    pub fn new(spec: NewQuotaInfo) -> Self {
        Self {
            name: spec.name,
            inner: RwLock::new(QuotaInfoInner {
                parent_name: spec.parent_name,
                tree_id: spec.tree_id,
                is_parent: spec.is_parent,
                max: spec.max,
                min: spec.min,
                shared_weight: spec.shared_weight,
                allow_lent_resource: spec.allow_lent_resource,
                request: ResourceAmount::zero(),
                used: ResourceAmount::zero(),
                non_preemptible_request: ResourceAmount::zero(),
                non_preemptible_used: ResourceAmount::zero(),
                runtime: ResourceAmount::zero(),
                allocated_resource: ResourceAmount::zero(),
                pod_cache: BTreeMap::new(),
                runtime_version: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, QuotaInfoInner> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QuotaInfoInner> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> QuotaInfoSnapshot {
        let g = self.read();
        QuotaInfoSnapshot {
            name: self.name.clone(),
            parent_name: g.parent_name.clone(),
            tree_id: g.tree_id.clone(),
            is_parent: g.is_parent,
            max: g.max.clone(),
            min: g.min.clone(),
            shared_weight: g.shared_weight.clone(),
            allow_lent_resource: g.allow_lent_resource,
            request: g.request.clone(),
            used: g.used.clone(),
            non_preemptible_request: g.non_preemptible_request.clone(),
            non_preemptible_used: g.non_preemptible_used.clone(),
            runtime: g.runtime.clone(),
            allocated_resource: g.allocated_resource.clone(),
            pod_count: g.pod_cache.len(),
            runtime_version: g.runtime_version,
        }
    }

    pub fn parent_name(&self) -> String {
        self.read().parent_name.clone()
    }

    pub fn set_parent_name(&self, parent: String) {
        self.write().parent_name = parent;
    }

    pub fn tree_id(&self) -> Option<String> {
        self.read().tree_id.clone()
    }

    pub fn is_parent(&self) -> bool {
        self.read().is_parent
    }

    pub fn pod_count(&self) -> usize {
        self.read().pod_cache.len()
    }

    pub fn min(&self) -> ResourceAmount {
        self.read().min.clone()
    }

    pub fn max(&self) -> ResourceAmount {
        self.read().max.clone()
    }

    pub fn shared_weight(&self) -> ResourceAmount {
        self.read().shared_weight.clone()
    }

    pub fn allow_lent_resource(&self) -> bool {
        self.read().allow_lent_resource
    }

    pub fn request(&self) -> ResourceAmount {
        self.read().request.clone()
    }

    pub fn used(&self) -> ResourceAmount {
        self.read().used.clone()
    }

    pub fn non_preemptible_used(&self) -> ResourceAmount {
        self.read().non_preemptible_used.clone()
    }

    pub fn non_preemptible_request(&self) -> ResourceAmount {
        self.read().non_preemptible_request.clone()
    }

    pub fn runtime(&self) -> ResourceAmount {
        self.read().runtime.clone()
    }

    pub fn runtime_version(&self) -> u64 {
        self.read().runtime_version
    }

    /// Applies `FillDefaults`/`ValidUpdate`-sanctioned structural field
    /// changes in one lock acquisition. Accounting counters and pod cache
    /// are untouched.
    pub fn apply_update(
        &self,
        is_parent: bool,
        max: ResourceAmount,
        min: ResourceAmount,
        shared_weight: ResourceAmount,
        allow_lent_resource: bool,
    ) {
        let mut g = self.write();
        g.is_parent = is_parent;
        g.max = max;
        g.min = min;
        g.shared_weight = shared_weight;
        g.allow_lent_resource = allow_lent_resource;
    }

    pub fn set_runtime(&self, runtime: ResourceAmount, version: u64) {
        let mut g = self.write();
        g.runtime = runtime;
        g.runtime_version = version;
    }

    pub fn bump_runtime_version(&self) {
        self.write().runtime_version += 1;
    }

    pub fn set_allocated_resource(&self, allocated: ResourceAmount) {
        self.write().allocated_resource = allocated;
    }

    /// Applies a signed delta to each of the four accounting counters
    /// (positive on add/migrate-in, negative on remove/migrate-out). The
    /// four deltas are independent because a non-preemptible pod's request
    /// is a subset of the group's total request, not a fixed fraction of
    /// whatever delta is being applied — callers compute all four from the
    /// same event so they stay consistent.
    ///
    /// Any counter going negative means a caller propagated a larger
    /// decrement than this group ever accumulated — the pod cache and the
    /// aggregates it feeds have desynchronized. That is always a bug, never
    /// a validation failure, so it is reported as [`AccountingError`]
    /// instead of one of [`crate::error::TopologyError`]'s variants.
    pub fn apply_delta(
        &self,
        request_delta: &ResourceAmount,
        used_delta: &ResourceAmount,
        non_preemptible_request_delta: &ResourceAmount,
        non_preemptible_used_delta: &ResourceAmount,
    ) -> Result<(), AccountingError> {
        let mut g = self.write();
        g.request += request_delta;
        g.used += used_delta;
        g.non_preemptible_request += non_preemptible_request_delta;
        g.non_preemptible_used += non_preemptible_used_delta;

        let zero = ResourceAmount::zero();
        if !g.request.ge_all(&zero)
            || !g.used.ge_all(&zero)
            || !g.non_preemptible_request.ge_all(&zero)
            || !g.non_preemptible_used.ge_all(&zero)
        {
            return AccountingSnafu {
                name: self.name.clone(),
                detail: format!(
                    "negative aggregate after delta: request={:?} used={:?} nonPreemptibleRequest={:?} nonPreemptibleUsed={:?}",
                    g.request, g.used, g.non_preemptible_request, g.non_preemptible_used
                ),
                bug: true,
            }
            .fail();
        }
        Ok(())
    }

    pub fn insert_pod(&self, uid: PodUid, pod: CachedPod) {
        self.write().pod_cache.insert(uid, pod);
    }

    pub fn remove_pod(&self, uid: &PodUid) -> Option<CachedPod> {
        self.write().pod_cache.remove(uid)
    }

    pub fn get_pod(&self, uid: &PodUid) -> Option<CachedPod> {
        self.read().pod_cache.get(uid).cloned()
    }

    pub fn pod_uids(&self) -> Vec<PodUid> {
        self.read().pod_cache.keys().cloned().collect()
    }

    pub fn is_empty_of_pods(&self) -> bool {
        self.read().pod_cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, parent: &str) -> QuotaInfo {
        QuotaInfo::new(NewQuotaInfo {
            name: name.to_string(),
            parent_name: parent.to_string(),
            tree_id: None,
            is_parent: false,
            max: ResourceAmount::cpu_mem(100, 100),
            min: ResourceAmount::cpu_mem(10, 10),
            shared_weight: ResourceAmount::cpu_mem(100, 100),
            allow_lent_resource: true,
        })
    }

    fn negate(a: &ResourceAmount) -> ResourceAmount {
        ResourceAmount {
            cpu_millis: -a.cpu_millis,
            memory_bytes: -a.memory_bytes,
            extended: a.extended.iter().map(|(k, v)| (k.clone(), -v)).collect(),
        }
    }

    #[test]
    fn apply_delta_updates_request_and_used() {
        let q = group("a", "root");
        let zero = ResourceAmount::zero();
        q.apply_delta(&ResourceAmount::cpu_mem(5, 5), &zero, &zero, &zero).unwrap();
        assert_eq!(q.request(), ResourceAmount::cpu_mem(5, 5));
        assert_eq!(q.used(), ResourceAmount::zero());

        q.apply_delta(&zero, &ResourceAmount::cpu_mem(5, 5), &zero, &zero).unwrap();
        assert_eq!(q.used(), ResourceAmount::cpu_mem(5, 5));
    }

    #[test]
    fn negative_delta_reverses_positive_delta() {
        let q = group("a", "root");
        let delta = ResourceAmount::cpu_mem(5, 5);
        q.apply_delta(&delta, &delta, &delta, &delta).unwrap();
        let neg = negate(&delta);
        q.apply_delta(&neg, &neg, &neg, &neg).unwrap();
        assert_eq!(q.request(), ResourceAmount::zero());
        assert_eq!(q.used(), ResourceAmount::zero());
        assert_eq!(q.non_preemptible_used(), ResourceAmount::zero());
    }

    #[test]
    fn delta_that_would_go_negative_is_reported_as_a_bug_and_leaves_the_error_inspectable() {
        let q = group("a", "root");
        let err = q
            .apply_delta(&ResourceAmount::cpu_mem(-5, 0), &ResourceAmount::zero(), &ResourceAmount::zero(), &ResourceAmount::zero())
            .unwrap_err();
        assert_eq!(err.name, "a");
        assert!(err.bug);
        assert!(err.detail.contains("negative aggregate"));
    }
}
