//! Routes structural and accounting operations to the
//! [`GroupQuotaManager`] that owns the relevant tree, keyed by tree id
//! (spec.md §4.4). The registry is the engine's one piece of process-wide
//! state; everything else is rebuilt from it on cold-start recovery.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    constants::ROOT,
    error::TopologyResult,
    manager::GroupQuotaManager,
    quota_info::QuotaInfo,
    resources::ResourceAmount,
    topology::QuotaSpecInput,
};

/// Groups with no explicit tree id all share this manager, keyed by the
/// empty string so a typed tree id is never mistaken for "untreed".
const UNTREED: &str = "";

/// Owns one [`GroupQuotaManager`] per tree id, creating managers lazily as
/// new tree ids are first seen.
pub struct QuotaManagerRegistry {
    managers: RwLock<HashMap<String, Arc<GroupQuotaManager>>>,
    strict_child_min: bool,
    enable_runtime_quota: bool,
}

impl QuotaManagerRegistry {
    pub fn new(strict_child_min: bool, enable_runtime_quota: bool) -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
            strict_child_min,
            enable_runtime_quota,
        }
    }

    fn key_for(tree_id: Option<&str>) -> String {
        tree_id.unwrap_or(UNTREED).to_string()
    }

    /// Returns the manager for `tree_id`, creating it if this is the first
    /// group ever seen for that tree.
    pub fn manager_for(&self, tree_id: Option<&str>) -> Arc<GroupQuotaManager> {
        let key = Self::key_for(tree_id);
        if let Some(manager) = self.managers.read().unwrap_or_else(std::sync::PoisonError::into_inner).get(&key) {
            return manager.clone();
        }
        let mut managers = self.managers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        managers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(GroupQuotaManager::new(
                    tree_id.map(str::to_string),
                    self.strict_child_min,
                    self.enable_runtime_quota,
                ))
            })
            .clone()
    }

    /// Finds the manager currently holding `name`, if any.
    pub fn manager_of(&self, name: &str) -> Option<Arc<GroupQuotaManager>> {
        self.managers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .find(|m| m.topology().contains(name))
            .cloned()
    }

    pub fn get_quota_info(&self, name: &str) -> Option<Arc<QuotaInfo>> {
        self.manager_of(name)?.get_quota_info(name)
    }

    /// Adds a quota group, routing to (and if necessary creating) the
    /// manager for its tree id. A root-flagged group (parent `"root"` with
    /// no tree id of its own) seeds its own fresh tree.
    pub fn add_quota(&self, input: QuotaSpecInput) -> TopologyResult<Arc<QuotaInfo>> {
        let manager = self.manager_for(input.tree_id.as_deref());
        let input = manager.topology().fill_defaults(input);
        manager.add_quota(input)
    }

    /// Updates a quota group in place. Reparenting across tree ids is
    /// rejected by `QuotaTopology::valid_update`'s `CrossTreeReparent`
    /// check before this ever needs to move a group between managers. An
    /// update of a name that exists nowhere is logged and ignored, the same
    /// not-found-is-idempotent treatment `delete_quota` already gives.
    pub fn update_quota(&self, input: QuotaSpecInput, old_namespaces: &[String]) -> TopologyResult<()> {
        let Some(manager) = self.manager_of(&input.name) else {
            tracing::warn!(name = %input.name, "update_quota: unknown quota group, dropping event");
            return Ok(());
        };
        let input = manager.topology().fill_defaults(input);
        manager.update_quota(input, old_namespaces)?;
        Ok(())
    }

    pub fn delete_quota(&self, name: &str) -> TopologyResult<()> {
        let Some(manager) = self.manager_of(name) else {
            return Ok(());
        };
        manager.delete_quota(name)
    }

    /// Materializes a reserved catch-all group (`"system"`/`"default"`) on
    /// the untreed manager if cold-start recovery finds it missing.
    pub fn ensure_reserved_quota(&self, name: &str, max: ResourceAmount) -> Arc<QuotaInfo> {
        self.manager_for(None).ensure_reserved_quota(name, max)
    }

    /// Applies the `total-resource` annotation on a root-flagged quota,
    /// setting the cluster total of the tree it roots.
    pub fn set_cluster_total(&self, tree_id: Option<&str>, total: ResourceAmount) {
        self.manager_for(tree_id).update_cluster_total_resource(total);
    }

    pub fn tree_ids(&self) -> Vec<Option<String>> {
        self.managers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .map(|k| if k == UNTREED { None } else { Some(k.clone()) })
            .collect()
    }

    pub fn root_name(&self) -> &str {
        ROOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, parent: Option<&str>, tree_id: Option<&str>) -> QuotaSpecInput {
        QuotaSpecInput {
            name: name.to_string(),
            parent_name: parent.map(str::to_string),
            tree_id: tree_id.map(str::to_string),
            is_parent: false,
            max: ResourceAmount::cpu_mem(100, 100),
            min: ResourceAmount::cpu_mem(0, 0),
            shared_weight: None,
            allow_lent_resource: true,
            namespaces: vec![],
        }
    }

    #[test]
    fn groups_in_different_trees_are_isolated() {
        let registry = QuotaManagerRegistry::new(true, true);
        registry.add_quota(spec("a", None, Some("tree-a"))).unwrap();
        registry.add_quota(spec("b", None, Some("tree-b"))).unwrap();

        assert!(registry.manager_of("a").unwrap().topology().contains("a"));
        assert!(!registry.manager_of("a").unwrap().topology().contains("b"));
    }

    #[test]
    fn set_cluster_total_only_affects_its_own_tree() {
        let registry = QuotaManagerRegistry::new(true, true);
        registry.add_quota(spec("a", None, Some("tree-a"))).unwrap();
        registry.add_quota(spec("b", None, Some("tree-b"))).unwrap();

        registry.set_cluster_total(Some("tree-a"), ResourceAmount::cpu_mem(500, 500));

        assert_eq!(
            registry.manager_for(Some("tree-a")).cluster_total_resource(),
            ResourceAmount::cpu_mem(500, 500)
        );
        assert_eq!(
            registry.manager_for(Some("tree-b")).cluster_total_resource(),
            ResourceAmount::zero()
        );
    }

    #[test]
    fn update_of_unknown_group_is_idempotent() {
        let registry = QuotaManagerRegistry::new(true, true);
        assert!(registry.update_quota(spec("ghost", None, None), &[]).is_ok());
    }

    #[test]
    fn delete_of_unknown_group_is_idempotent() {
        let registry = QuotaManagerRegistry::new(true, true);
        assert!(registry.delete_quota("ghost").is_ok());
    }
}
