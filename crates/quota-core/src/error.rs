//! Typed errors for quota tree validation and accounting.
//!
//! Validation failures are rejected at the call site and never leave the
//! tree mutated; accounting errors indicate the tree and its aggregates have
//! desynchronized, which is always a bug in a caller that bypassed the
//! topology/manager API.

use snafu::Snafu;

use crate::resources::Dimension;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TopologyError {
    #[snafu(display("quota group {name:?} already exists"))]
    NameAlreadyExists { name: String },

    #[snafu(display("namespace {namespace:?} is already bound to quota group {bound_to:?}"))]
    NamespaceAlreadyBound { namespace: String, bound_to: String },

    #[snafu(display("{name:?} is a reserved quota group name"))]
    ReservedName { name: String },

    #[snafu(display("quota group name must not be empty"))]
    EmptyName,

    #[snafu(display("min exceeds max on dimension {dimension} for quota group {name:?} ({min} > {max})"))]
    MinExceedsMax {
        name: String,
        dimension: Dimension,
        min: i64,
        max: i64,
    },

    #[snafu(display("shared weight on dimension {dimension} is negative for quota group {name:?}"))]
    NegativeWeight { name: String, dimension: Dimension },

    #[snafu(display("parent quota group {parent:?} of {name:?} does not exist"))]
    ParentNotFound { name: String, parent: String },

    #[snafu(display("quota group {name:?} does not exist"))]
    GroupNotFound { name: String },

    #[snafu(display("reparenting {name:?} under its own descendant {parent:?} would create a cycle"))]
    CyclicParent { name: String, parent: String },

    #[snafu(display("cannot attach {name:?} under {parent:?}: {parent:?} is a leaf with pods"))]
    ParentIsLeafWithPods { name: String, parent: String },

    #[snafu(display(
        "sum of child min on dimension {dimension} under {parent:?} would exceed parent min ({child_min_sum} > {parent_min})"
    ))]
    ChildMinExceedsParentMin {
        parent: String,
        dimension: Dimension,
        child_min_sum: i64,
        parent_min: i64,
    },

    #[snafu(display("quota group {name:?} has {child_count} children and cannot be deleted"))]
    HasChildren { name: String, child_count: usize },

    #[snafu(display("quota group {name:?} still has {pod_count} pods and cannot be deleted"))]
    HasPods { name: String, pod_count: usize },

    #[snafu(display("cannot move quota group {name:?} from tree {from:?} to tree {to:?}"))]
    CrossTreeReparent {
        name: String,
        from: String,
        to: String,
    },

    #[snafu(display("tree id of quota group {name:?} cannot be changed once set"))]
    TreeIdImmutable { name: String },

    #[snafu(display(
        "flipping quota group {name:?} from parent to leaf is rejected: {descendant:?} still has pods"
    ))]
    DescendantHasPods { name: String, descendant: String },

    #[snafu(display("quota group {name:?} cannot become a parent while it still has pods"))]
    LeafToParentWithPods { name: String },
}

/// Indicates the tree's cached aggregates have desynchronized from its pod
/// caches. Always a bug: every mutation path goes through
/// [`crate::manager::GroupQuotaManager`], which keeps the two in lockstep.
/// `bug` is always `true`; it exists so the field shows up in the
/// `tracing::error!` record this type is logged with rather than only in its
/// `Display` text.
#[derive(Debug, Snafu)]
#[snafu(display("BUG: accounting invariant violated for quota group {name:?}: {detail}"))]
pub struct AccountingError {
    pub name: String,
    pub detail: String,
    pub bug: bool,
}

impl AccountingError {
    /// Logs this error at the `"BUG"` target and drops it. Internal
    /// inconsistencies are fatal-but-unrecoverable for the request that
    /// uncovered them: per spec, they are reported, never propagated up
    /// through the admission path.
    pub fn log(&self) {
        tracing::error!(target: "BUG", bug = self.bug, name = %self.name, detail = %self.detail, "accounting invariant violated");
    }
}

pub type TopologyResult<T> = Result<T, TopologyError>;
pub type AccountingResult<T> = Result<T, AccountingError>;
