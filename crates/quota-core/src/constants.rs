//! Reserved quota group names and the Kubernetes labels/annotations the
//! engine reads off `ElasticQuota` and `Pod` objects (spec.md §6).

/// Abstract aggregate parent for all top-level groups. Never a pod target.
pub const ROOT: &str = "root";
/// Catches pods outside user-defined quotas (system daemons).
pub const SYSTEM: &str = "system";
/// Fall-back for pods whose resolved group does not exist.
pub const DEFAULT: &str = "default";

pub fn is_reserved(name: &str) -> bool {
    matches!(name, ROOT | SYSTEM | DEFAULT)
}

/// `ElasticQuota` label naming the parent group.
pub const LABEL_QUOTA_PARENT: &str = "quota-parent";
/// `ElasticQuota` label naming the tree this group belongs to.
pub const LABEL_QUOTA_TREE_ID: &str = "quota-tree-id";
/// `ElasticQuota` label marking a group as a parent (may have children, no pods).
pub const LABEL_QUOTA_IS_PARENT: &str = "quota-is-parent";
/// `ElasticQuota` label marking a group as the root of its tree's cluster-total.
pub const LABEL_QUOTA_IS_ROOT: &str = "quota-is-root";

/// JSON-encoded resource map annotation overriding the default shared weight.
pub const ANNOTATION_SHARED_WEIGHT: &str = "shared-weight";
/// JSON-encoded resource map annotation supplying the cluster total for a
/// root-flagged quota's tree.
pub const ANNOTATION_TOTAL_RESOURCE: &str = "total-resource";
/// JSON-encoded list of namespaces this quota group is bound to.
pub const ANNOTATION_QUOTA_NAMESPACES: &str = "quota-namespaces";

/// Pod label naming the explicit target quota group.
pub const LABEL_QUOTA_NAME: &str = "quota-name";
/// Pod label marking a pod as ineligible for preemption.
pub const LABEL_PREEMPTIBLE: &str = "preemptible";
