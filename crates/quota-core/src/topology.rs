//! Validates and applies structural changes to the quota tree: adding,
//! updating (including reparenting), and deleting groups, plus the
//! namespace→quota binding (spec.md §4.1).
//!
//! `QuotaTopology` holds one coarse lock for every structural mutation.
//! Mutations are brief (map inserts/removes), so holding the lock across the
//! whole validate-then-apply call is cheap and keeps the tree always
//! internally consistent between calls — no caller ever observes a half
//! applied structural change.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
};

use crate::{
    constants::{is_reserved, ROOT},
    error::{
        ChildMinExceedsParentMinSnafu, CrossTreeReparentSnafu, CyclicParentSnafu,
        DescendantHasPodsSnafu, EmptyNameSnafu, GroupNotFoundSnafu, HasChildrenSnafu,
        HasPodsSnafu, LeafToParentWithPodsSnafu, MinExceedsMaxSnafu, NameAlreadyExistsSnafu,
        NamespaceAlreadyBoundSnafu, NegativeWeightSnafu, ParentIsLeafWithPodsSnafu,
        ParentNotFoundSnafu, ReservedNameSnafu, TopologyError, TopologyResult,
        TreeIdImmutableSnafu,
    },
    quota_info::{NewQuotaInfo, QuotaInfo},
    resources::ResourceAmount,
};

/// Desired state for a quota group, as submitted by a caller (after the
/// `ElasticQuota` object has been decoded). Optional fields are filled in by
/// [`QuotaTopology::fill_defaults`] before validation.
#[derive(Clone, Debug)]
pub struct QuotaSpecInput {
    pub name: String,
    pub parent_name: Option<String>,
    pub tree_id: Option<String>,
    pub is_parent: bool,
    pub max: ResourceAmount,
    pub min: ResourceAmount,
    pub shared_weight: Option<ResourceAmount>,
    pub allow_lent_resource: bool,
    pub namespaces: Vec<String>,
}

struct TopologyState {
    groups: HashMap<String, Arc<QuotaInfo>>,
    /// parent name (or `"root"`) → set of child names.
    children: HashMap<String, BTreeSet<String>>,
    namespace_to_quota: HashMap<String, String>,
}

/// Selects invariant 4's enforcement mode: strict mode rejects a child Min
/// that would push the sum of sibling Mins over the parent's Min; relaxed
/// mode allows it (over-commitment of Min is then arbitrated by the runtime
/// calculator at scheduling time).
pub struct QuotaTopology {
    strict_child_min: bool,
    state: RwLock<TopologyState>,
}

impl QuotaTopology {
    pub fn new(strict_child_min: bool) -> Self {
        Self {
            strict_child_min,
            state: RwLock::new(TopologyState {
                groups: HashMap::new(),
                children: HashMap::new(),
                namespace_to_quota: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::RwLockReadGuard<'_, TopologyState> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, TopologyState> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<Arc<QuotaInfo>> {
        self.state().groups.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state().groups.contains_key(name)
    }

    pub fn children_of(&self, parent: &str) -> Vec<Arc<QuotaInfo>> {
        let state = self.state();
        state
            .children
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|name| state.groups.get(name).cloned())
            .collect()
    }

    pub fn child_count(&self, parent: &str) -> usize {
        self.state().children.get(parent).map_or(0, BTreeSet::len)
    }

    /// The chain from `name` up to (but not including) `"root"`, nearest
    /// ancestor first.
    pub fn ancestor_chain(&self, name: &str) -> Vec<Arc<QuotaInfo>> {
        let mut chain = Vec::new();
        let mut current = name.to_string();
        let state = self.state();
        while let Some(group) = state.groups.get(&current) {
            let parent = group.parent_name();
            if parent == current {
                break;
            }
            if let Some(parent_group) = state.groups.get(&parent) {
                chain.push(parent_group.clone());
            }
            if parent == ROOT {
                break;
            }
            current = parent;
        }
        chain
    }

    /// `true` if `candidate` is `name` or a descendant of it — used to
    /// reject reparenting a group under its own subtree.
    fn is_self_or_descendant(state: &TopologyState, name: &str, candidate: &str) -> bool {
        if name == candidate {
            return true;
        }
        state
            .children
            .get(name)
            .into_iter()
            .flatten()
            .any(|child| Self::is_self_or_descendant(state, child, candidate))
    }

    /// The first descendant of `name` (depth-first) that still has pods in
    /// its cache, if any — used to reject flipping a parent back to a leaf.
    fn first_descendant_with_pods(state: &TopologyState, name: &str) -> Option<String> {
        for child_name in state.children.get(name).into_iter().flatten() {
            if let Some(child) = state.groups.get(child_name) {
                if child.pod_count() > 0 {
                    return Some(child_name.clone());
                }
                if let Some(found) = Self::first_descendant_with_pods(state, child_name) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// FillDefaults: parent defaults to `"root"`, shared weight defaults to
    /// Max, tree id is inherited from the parent when unset.
    pub fn fill_defaults(&self, mut input: QuotaSpecInput) -> QuotaSpecInput {
        let parent = match input.parent_name.as_deref() {
            None | Some("") => ROOT.to_string(),
            Some(p) => p.to_string(),
        };
        if input.shared_weight.is_none() {
            input.shared_weight = Some(input.max.clone());
        }
        if input.tree_id.is_none() {
            let state = self.state();
            input.tree_id = state.groups.get(&parent).and_then(|p| p.tree_id());
        }
        input.parent_name = Some(parent);
        input
    }

    fn check_self_consistency(input: &QuotaSpecInput) -> TopologyResult<()> {
        if input.name.is_empty() {
            return EmptyNameSnafu.fail();
        }
        if is_reserved(&input.name) {
            return ReservedNameSnafu { name: input.name.clone() }.fail();
        }
        for dim in ResourceAmount::dimensions_union(&input.min, &input.max) {
            let min = input.min.get(&dim);
            let max = input.max.get(&dim);
            if min > max {
                return MinExceedsMaxSnafu {
                    name: input.name.clone(),
                    dimension: dim,
                    min,
                    max,
                }
                .fail();
            }
        }
        if let Some(weight) = &input.shared_weight {
            for dim in ResourceAmount::dimensions_union(weight, &ResourceAmount::zero()) {
                if weight.get(&dim) < 0 {
                    return NegativeWeightSnafu {
                        name: input.name.clone(),
                        dimension: dim,
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    fn check_hierarchy(
        &self,
        state: &TopologyState,
        input: &QuotaSpecInput,
        reparenting_existing: bool,
    ) -> TopologyResult<()> {
        let parent_name = input.parent_name.as_deref().unwrap_or(ROOT);
        if parent_name != ROOT && !state.groups.contains_key(parent_name) {
            return ParentNotFoundSnafu {
                name: input.name.clone(),
                parent: parent_name.to_string(),
            }
            .fail();
        }
        if let Some(parent) = state.groups.get(parent_name) {
            if !parent.is_parent() && parent.pod_count() > 0 {
                return ParentIsLeafWithPodsSnafu {
                    name: input.name.clone(),
                    parent: parent_name.to_string(),
                }
                .fail();
            }
            if self.strict_child_min {
                let mut child_min_sum = input.min.clone();
                for sibling_name in state.children.get(parent_name).into_iter().flatten() {
                    if reparenting_existing && sibling_name == &input.name {
                        continue;
                    }
                    if let Some(sibling) = state.groups.get(sibling_name) {
                        child_min_sum += &sibling.min();
                    }
                }
                let parent_min = parent.min();
                for dim in ResourceAmount::dimensions_union(&child_min_sum, &parent_min) {
                    let sum = child_min_sum.get(&dim);
                    let cap = parent_min.get(&dim);
                    if sum > cap {
                        return ChildMinExceedsParentMinSnafu {
                            parent: parent_name.to_string(),
                            dimension: dim,
                            child_min_sum: sum,
                            parent_min: cap,
                        }
                        .fail();
                    }
                }
            }
        }
        Ok(())
    }

    /// Validates a prospective Add without applying it.
    pub fn valid_add(&self, input: &QuotaSpecInput) -> TopologyResult<()> {
        let state = self.state();
        if state.groups.contains_key(&input.name) {
            return NameAlreadyExistsSnafu { name: input.name.clone() }.fail();
        }
        for namespace in &input.namespaces {
            if let Some(bound_to) = state.namespace_to_quota.get(namespace) {
                return NamespaceAlreadyBoundSnafu {
                    namespace: namespace.clone(),
                    bound_to: bound_to.clone(),
                }
                .fail();
            }
        }
        Self::check_self_consistency(input)?;
        self.check_hierarchy(&state, input, false)?;
        Ok(())
    }

    /// An Add of a name that already exists is rejected, except when the
    /// resubmitted spec is identical to what's already there (same parent,
    /// tree id, max/min/weight/allow-lent, and namespace bindings): that
    /// case is treated as an idempotent success and returns the existing
    /// group unchanged, so re-applying the same `ElasticQuota` object (e.g.
    /// on a watch resync) never resets its accounting.
    fn matches_existing(state: &TopologyState, existing: &QuotaInfo, input: &QuotaSpecInput) -> bool {
        let parent_matches = existing.parent_name() == input.parent_name.clone().unwrap_or_else(|| ROOT.to_string());
        let weight_matches =
            existing.shared_weight() == input.shared_weight.clone().unwrap_or_else(|| input.max.clone());
        let current_namespaces: BTreeSet<&str> = state
            .namespace_to_quota
            .iter()
            .filter(|(_, bound_to)| bound_to.as_str() == input.name)
            .map(|(namespace, _)| namespace.as_str())
            .collect();
        let requested_namespaces: BTreeSet<&str> = input.namespaces.iter().map(String::as_str).collect();

        parent_matches
            && existing.tree_id() == input.tree_id
            && existing.is_parent() == input.is_parent
            && existing.max() == input.max
            && existing.min() == input.min
            && weight_matches
            && existing.allow_lent_resource() == input.allow_lent_resource
            && current_namespaces == requested_namespaces
    }

    /// Validates and applies an Add, returning the new group's handle.
    pub fn add(&self, input: QuotaSpecInput) -> TopologyResult<Arc<QuotaInfo>> {
        {
            let state = self.state();
            if let Some(existing) = state.groups.get(&input.name) {
                return if Self::matches_existing(&state, existing, &input) {
                    Ok(existing.clone())
                } else {
                    NameAlreadyExistsSnafu { name: input.name.clone() }.fail()
                };
            }
        }
        self.valid_add(&input)?;
        let mut state = self.state_mut();

        let group = Arc::new(QuotaInfo::new(NewQuotaInfo {
            name: input.name.clone(),
            parent_name: input.parent_name.clone().unwrap_or_else(|| ROOT.to_string()),
            tree_id: input.tree_id.clone(),
            is_parent: input.is_parent,
            max: input.max.clone(),
            min: input.min.clone(),
            shared_weight: input.shared_weight.clone().unwrap_or_else(|| input.max.clone()),
            allow_lent_resource: input.allow_lent_resource,
        }));

        state
            .children
            .entry(input.parent_name.clone().unwrap_or_else(|| ROOT.to_string()))
            .or_default()
            .insert(input.name.clone());
        for namespace in &input.namespaces {
            state.namespace_to_quota.insert(namespace.clone(), input.name.clone());
        }
        state.groups.insert(input.name.clone(), group.clone());

        Ok(group)
    }

    /// Validates a prospective Update (including reparenting) without
    /// applying it. An update that is a no-op on all fields Topology cares
    /// about succeeds idempotently.
    pub fn valid_update(&self, input: &QuotaSpecInput) -> TopologyResult<()> {
        let state = self.state();
        let Some(existing) = state.groups.get(&input.name) else {
            return GroupNotFoundSnafu { name: input.name.clone() }.fail();
        };

        if let (Some(existing_tree), Some(new_tree)) = (existing.tree_id(), input.tree_id.clone())
        {
            if existing_tree != new_tree {
                return TreeIdImmutableSnafu { name: input.name.clone() }.fail();
            }
        }

        let new_parent = input.parent_name.as_deref().unwrap_or(ROOT);
        if new_parent != existing.parent_name() {
            if let (Some(from), Some(to)) = (
                existing.tree_id(),
                state.groups.get(new_parent).and_then(|p| p.tree_id()),
            ) {
                if from != to {
                    return CrossTreeReparentSnafu {
                        name: input.name.clone(),
                        from,
                        to,
                    }
                    .fail();
                }
            }
            if Self::is_self_or_descendant(&state, &input.name, new_parent) {
                return CyclicParentSnafu {
                    name: input.name.clone(),
                    parent: new_parent.to_string(),
                }
                .fail();
            }
        }

        if existing.is_parent() && !input.is_parent {
            if let Some(descendant) = Self::first_descendant_with_pods(&state, &input.name) {
                return DescendantHasPodsSnafu {
                    name: input.name.clone(),
                    descendant,
                }
                .fail();
            }
        }
        if !existing.is_parent() && input.is_parent && existing.pod_count() > 0 {
            return LeafToParentWithPodsSnafu { name: input.name.clone() }.fail();
        }

        Self::check_self_consistency(input)?;
        self.check_hierarchy(&state, input, true)?;
        Ok(())
    }

    /// Validates and applies an Update, moving the group under its new
    /// parent if `parent_name` changed and updating namespace bindings.
    /// Returns the group's handle; its accounting counters are untouched —
    /// reparenting the accounting itself is the caller's (the manager's)
    /// job, since Topology only owns structure.
    pub fn update(
        &self,
        input: QuotaSpecInput,
        old_namespaces: &[String],
    ) -> TopologyResult<Arc<QuotaInfo>> {
        self.valid_update(&input)?;
        let mut state = self.state_mut();

        let group = state.groups.get(&input.name).cloned().expect("validated above");
        let old_parent = group.parent_name();
        let new_parent = input.parent_name.clone().unwrap_or_else(|| ROOT.to_string());

        if old_parent != new_parent {
            if let Some(siblings) = state.children.get_mut(&old_parent) {
                siblings.remove(&input.name);
            }
            state.children.entry(new_parent.clone()).or_default().insert(input.name.clone());
            group.set_parent_name(new_parent);
        }

        for namespace in old_namespaces {
            if state.namespace_to_quota.get(namespace) == Some(&input.name) {
                state.namespace_to_quota.remove(namespace);
            }
        }
        for namespace in &input.namespaces {
            state.namespace_to_quota.insert(namespace.clone(), input.name.clone());
        }

        group.apply_update(
            input.is_parent,
            input.max.clone(),
            input.min.clone(),
            input.shared_weight.clone().unwrap_or(input.max),
            input.allow_lent_resource,
        );

        Ok(group)
    }

    pub fn valid_delete(&self, name: &str) -> TopologyResult<()> {
        if is_reserved(name) {
            return ReservedNameSnafu { name: name.to_string() }.fail();
        }
        let state = self.state();
        let Some(group) = state.groups.get(name) else {
            return Ok(()); // not-found deletes are idempotent, see §7
        };
        let child_count = self.child_count(name);
        if child_count > 0 {
            return HasChildrenSnafu { name: name.to_string(), child_count }.fail();
        }
        let pod_count = group.pod_count();
        if pod_count > 0 {
            return HasPodsSnafu { name: name.to_string(), pod_count }.fail();
        }
        Ok(())
    }

    pub fn delete(&self, name: &str) -> TopologyResult<Option<Arc<QuotaInfo>>> {
        self.valid_delete(name)?;
        let mut state = self.state_mut();
        let Some(group) = state.groups.remove(name) else {
            return Ok(None);
        };
        let parent = group.parent_name();
        if let Some(siblings) = state.children.get_mut(&parent) {
            siblings.remove(name);
        }
        state.children.remove(name);
        state.namespace_to_quota.retain(|_, quota| quota != name);
        Ok(Some(group))
    }

    /// Materializes one of the reserved catch-all groups (`"system"` /
    /// `"default"`) directly under root, bypassing `ValidAdd`'s
    /// reserved-name rejection — the one path allowed to create them, used
    /// by cold-start recovery and plugin construction. Idempotent.
    pub fn ensure_reserved(&self, name: &str, max: ResourceAmount) -> Arc<QuotaInfo> {
        let mut state = self.state_mut();
        if let Some(existing) = state.groups.get(name) {
            return existing.clone();
        }
        let group = Arc::new(QuotaInfo::new(NewQuotaInfo {
            name: name.to_string(),
            parent_name: ROOT.to_string(),
            tree_id: None,
            is_parent: false,
            max: max.clone(),
            min: ResourceAmount::zero(),
            shared_weight: max,
            allow_lent_resource: true,
        }));
        state.children.entry(ROOT.to_string()).or_default().insert(name.to_string());
        state.groups.insert(name.to_string(), group.clone());
        group
    }

    pub fn resolve_namespace(&self, namespace: &str) -> Option<String> {
        self.state().namespace_to_quota.get(namespace).cloned()
    }

    pub fn all_names(&self) -> Vec<String> {
        self.state().groups.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, parent: Option<&str>, min: (i64, i64), max: (i64, i64)) -> QuotaSpecInput {
        QuotaSpecInput {
            name: name.to_string(),
            parent_name: parent.map(str::to_string),
            tree_id: None,
            is_parent: false,
            max: ResourceAmount::cpu_mem(max.0, max.1),
            min: ResourceAmount::cpu_mem(min.0, min.1),
            shared_weight: None,
            allow_lent_resource: true,
            namespaces: vec![],
        }
    }

    #[test]
    fn add_rejects_unknown_parent() {
        let topo = QuotaTopology::new(true);
        let err = topo
            .add(spec("a", Some("ghost"), (0, 0), (10, 10)))
            .unwrap_err();
        assert!(matches!(err, TopologyError::ParentNotFound { .. }));
    }

    #[test]
    fn add_rejects_reserved_name() {
        let topo = QuotaTopology::new(true);
        let err = topo.add(spec("root", None, (0, 0), (10, 10))).unwrap_err();
        assert!(matches!(err, TopologyError::ReservedName { .. }));
    }

    #[test]
    fn add_rejects_min_greater_than_max() {
        let topo = QuotaTopology::new(true);
        let err = topo.add(spec("a", None, (20, 0), (10, 10))).unwrap_err();
        assert!(matches!(err, TopologyError::MinExceedsMax { .. }));
    }

    #[test]
    fn readding_an_identical_spec_is_idempotent() {
        let topo = QuotaTopology::new(true);
        let first = topo.add(spec("a", None, (0, 0), (10, 10))).unwrap();
        let second = topo.add(spec("a", None, (0, 0), (10, 10))).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn readding_a_changed_spec_is_rejected() {
        let topo = QuotaTopology::new(true);
        topo.add(spec("a", None, (0, 0), (10, 10))).unwrap();
        let err = topo.add(spec("a", None, (0, 0), (20, 20))).unwrap_err();
        assert!(matches!(err, TopologyError::NameAlreadyExists { .. }));
    }

    #[test]
    fn strict_mode_rejects_child_min_over_parent_min() {
        let topo = QuotaTopology::new(true);
        topo.add(spec("parent", None, (10, 10), (100, 100))).unwrap();
        let err = topo
            .add(spec("child", Some("parent"), (20, 0), (50, 50)))
            .unwrap_err();
        assert!(matches!(err, TopologyError::ChildMinExceedsParentMin { .. }));
    }

    #[test]
    fn relaxed_mode_allows_child_min_over_parent_min() {
        let topo = QuotaTopology::new(false);
        topo.add(spec("parent", None, (10, 10), (100, 100))).unwrap();
        topo.add(spec("child", Some("parent"), (20, 0), (50, 50))).unwrap();
        assert_eq!(topo.child_count("parent"), 1);
    }

    #[test]
    fn delete_rejects_group_with_children() {
        let topo = QuotaTopology::new(true);
        topo.add(spec("parent", None, (0, 0), (100, 100))).unwrap();
        topo.add(spec("child", Some("parent"), (0, 0), (50, 50))).unwrap();
        let err = topo.valid_delete("parent").unwrap_err();
        assert!(matches!(err, TopologyError::HasChildren { .. }));
    }

    #[test]
    fn delete_of_unknown_group_is_idempotent() {
        let topo = QuotaTopology::new(true);
        assert!(topo.valid_delete("never-existed").is_ok());
    }

    #[test]
    fn reserved_groups_cannot_be_deleted() {
        let topo = QuotaTopology::new(true);
        let err = topo.valid_delete(ROOT).unwrap_err();
        assert!(matches!(err, TopologyError::ReservedName { .. }));
    }

    #[test]
    fn reparent_moves_child_set_membership() {
        let topo = QuotaTopology::new(true);
        topo.add(spec("t1", None, (0, 0), (200, 200))).unwrap();
        topo.add(spec("t2", None, (0, 0), (200, 200))).unwrap();
        topo.add(spec("leaf", Some("t1"), (0, 0), (50, 50))).unwrap();
        assert_eq!(topo.child_count("t1"), 1);
        assert_eq!(topo.child_count("t2"), 0);

        let mut moved = spec("leaf", Some("t2"), (0, 0), (50, 50));
        moved.tree_id = None;
        topo.update(moved, &[]).unwrap();

        assert_eq!(topo.child_count("t1"), 0);
        assert_eq!(topo.child_count("t2"), 1);
        assert_eq!(topo.get("leaf").unwrap().parent_name(), "t2");
    }

    #[test]
    fn reparenting_under_own_descendant_is_rejected() {
        let topo = QuotaTopology::new(true);
        topo.add(spec("a", None, (0, 0), (100, 100))).unwrap();
        topo.add(spec("b", Some("a"), (0, 0), (50, 50))).unwrap();

        let mut cyclic = spec("a", Some("b"), (0, 0), (100, 100));
        cyclic.tree_id = None;
        let err = topo.valid_update(&cyclic).unwrap_err();
        assert!(matches!(err, TopologyError::CyclicParent { .. }));
    }

    #[test]
    fn namespace_binding_is_injective() {
        let topo = QuotaTopology::new(true);
        let mut a = spec("a", None, (0, 0), (100, 100));
        a.namespaces = vec!["ns1".to_string()];
        topo.add(a).unwrap();

        let mut b = spec("b", None, (0, 0), (100, 100));
        b.namespaces = vec!["ns1".to_string()];
        let err = topo.add(b).unwrap_err();
        assert!(matches!(err, TopologyError::NamespaceAlreadyBound { .. }));
    }

    #[test]
    fn flipping_parent_to_leaf_with_pods_in_descendant_is_rejected() {
        let topo = QuotaTopology::new(true);
        let mut parent_spec = spec("parent", None, (0, 0), (100, 100));
        parent_spec.is_parent = true;
        topo.add(parent_spec).unwrap();
        topo.add(spec("child", Some("parent"), (0, 0), (50, 50))).unwrap();

        let child = topo.get("child").unwrap();
        child.insert_pod(
            crate::pod::PodUid("pod-1".to_string()),
            crate::pod::CachedPod::new(ResourceAmount::cpu_mem(1, 1), crate::pod::PodPhase::Running, false),
        );

        let mut flipped = spec("parent", None, (0, 0), (100, 100));
        flipped.is_parent = false;
        let err = topo.valid_update(&flipped).unwrap_err();
        assert!(matches!(err, TopologyError::DescendantHasPods { .. }));
    }
}
