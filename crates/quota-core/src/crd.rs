//! The `ElasticQuota` custom resource: the wire shape the informer layer
//! lists/watches and that `quota-scheduler`'s event handlers decode into a
//! [`crate::topology::QuotaSpecInput`] (spec.md §6).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        ANNOTATION_QUOTA_NAMESPACES, ANNOTATION_SHARED_WEIGHT, ANNOTATION_TOTAL_RESOURCE,
        LABEL_QUOTA_IS_PARENT, LABEL_QUOTA_IS_ROOT, LABEL_QUOTA_PARENT, LABEL_QUOTA_TREE_ID,
    },
    resources::{parse_cpu_millis, parse_memory_bytes, QuantityParseError, ResourceAmount},
};

/// A quota group, decoded from an `ElasticQuota` object plus its labels and
/// annotations. `max`/`min` follow the Kubernetes resource-list convention
/// (`"cpu"`/`"memory"` keys alongside extended resource names).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "scheduling.quota.example.com",
    version = "v1alpha1",
    kind = "ElasticQuota",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticQuotaSpec {
    pub max: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub min: BTreeMap<String, Quantity>,
}

/// Parses a Kubernetes resource-list map (`{"cpu": "2", "memory": "4Gi"}`)
/// into a [`ResourceAmount`].
pub fn parse_resource_list(
    list: &BTreeMap<String, Quantity>,
) -> Result<ResourceAmount, QuantityParseError> {
    let mut amount = ResourceAmount::zero();
    for (key, quantity) in list {
        match key.as_str() {
            "cpu" => amount.cpu_millis = parse_cpu_millis(quantity)?,
            "memory" => amount.memory_bytes = parse_memory_bytes(quantity)?,
            other => {
                let parsed = parse_memory_bytes(quantity)?;
                amount.extended.insert(other.to_string(), parsed);
            }
        }
    }
    Ok(amount)
}

/// The subset of an `ElasticQuota` object's labels this engine reads,
/// extracted by the caller from `ObjectMeta::labels` before building a
/// [`crate::topology::QuotaSpecInput`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaLabels {
    pub parent: Option<String>,
    pub tree_id: Option<String>,
    pub is_parent: bool,
    pub is_root: bool,
}

impl QuotaLabels {
    pub fn from_map(labels: &BTreeMap<String, String>) -> Self {
        Self {
            parent: labels.get(LABEL_QUOTA_PARENT).cloned(),
            tree_id: labels.get(LABEL_QUOTA_TREE_ID).cloned(),
            is_parent: labels.get(LABEL_QUOTA_IS_PARENT).is_some_and(|v| v == "true"),
            is_root: labels.get(LABEL_QUOTA_IS_ROOT).is_some_and(|v| v == "true"),
        }
    }
}

/// The subset of an `ElasticQuota` object's annotations this engine reads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaAnnotations {
    pub shared_weight: Option<BTreeMap<String, Quantity>>,
    pub total_resource: Option<BTreeMap<String, Quantity>>,
    pub namespaces: Vec<String>,
}

impl QuotaAnnotations {
    pub fn from_map(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            shared_weight: annotations
                .get(ANNOTATION_SHARED_WEIGHT)
                .and_then(|raw| serde_json::from_str(raw).ok()),
            total_resource: annotations
                .get(ANNOTATION_TOTAL_RESOURCE)
                .and_then(|raw| serde_json::from_str(raw).ok()),
            namespaces: annotations
                .get(ANNOTATION_QUOTA_NAMESPACES)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_list_with_cpu_and_memory() {
        let mut list = BTreeMap::new();
        list.insert("cpu".to_string(), Quantity("2".to_string()));
        list.insert("memory".to_string(), Quantity("1Gi".to_string()));

        let amount = parse_resource_list(&list).unwrap();
        assert_eq!(amount.cpu_millis, 2000);
        assert_eq!(amount.memory_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn quota_labels_default_to_not_parent_not_root() {
        let labels = QuotaLabels::from_map(&BTreeMap::new());
        assert!(!labels.is_parent);
        assert!(!labels.is_root);
        assert!(labels.parent.is_none());
    }

    #[test]
    fn quota_annotations_missing_namespaces_defaults_empty() {
        let annotations = QuotaAnnotations::from_map(&BTreeMap::new());
        assert!(annotations.namespaces.is_empty());
    }
}
