//! DevServerFlavor Custom Resource Definition.
//!
//! A flavor is a cluster-scoped template of resource requests, limits,
//! node selectors and tolerations. The operator only reads flavors; their
//! lifecycle is managed externally.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Condition;

/// DevServerFlavor is the Schema for the devserverflavors API.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "devserver.io",
    version = "v1",
    kind = "DevServerFlavor",
    plural = "devserverflavors",
    shortname = "dvsf",
    status = "DevServerFlavorStatus",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevServerFlavorSpec {
    /// Resource envelope applied to each pod.
    #[serde(default)]
    pub resources: FlavorResources,

    /// Node selector copied to each pod.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations copied to each pod.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

/// Requests and limits as Kubernetes quantity maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlavorResources {
    /// Resource requests, e.g. `{"cpu": "2", "memory": "4Gi"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Resource limits.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Kubernetes toleration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key to match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Operator (Equal or Exists).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// Taint value to match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Effect (NoSchedule, PreferNoSchedule, NoExecute).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    /// Toleration seconds for NoExecute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// DevServerFlavor status: conditions only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevServerFlavorStatus {
    /// Conditions with unique type keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
