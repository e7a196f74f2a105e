//! The read surface cold-start recovery and the migrator need onto the
//! informer layer's caches. Kept as a trait rather than a concrete lister
//! type so tests can fake a cluster without standing up a `kube::Client`.

use k8s_openapi::api::core::v1::Pod;
use quota_core::{crd::ElasticQuota, pod::PodUid, resources::ResourceAmount};

/// A read-only snapshot of what the informer layer currently knows.
/// Implemented once over the real pod/quota listers in production, and by a
/// plain in-memory fake in tests.
pub trait ClusterView: Send + Sync {
    fn list_quotas(&self) -> Vec<ElasticQuota>;
    fn list_pods(&self) -> Vec<Pod>;
    fn get_pod(&self, uid: &PodUid) -> Option<Pod>;
    /// Sum of schedulable capacity across all nodes, used to seed a tree's
    /// cluster total when no quota in it carries an explicit `total-resource`
    /// annotation.
    fn node_capacity_total(&self) -> ResourceAmount;
}
