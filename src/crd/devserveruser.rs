//! DevServerUser Custom Resource Definition.
//!
//! Binds a human identity to a namespace and RBAC inside the cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Condition;

/// DevServerUser is the Schema for the devserverusers API.
///
/// For a user `bob` the operator provisions namespace `dev-bob`, service
/// account `bob-sa`, role `dev-user`, a role binding, and a resource
/// quota. All of them are owned by the DevServerUser so that deleting the
/// user cascades.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "devserver.io",
    version = "v1",
    kind = "DevServerUser",
    plural = "devserverusers",
    shortname = "dvsu",
    status = "DevServerUserStatus",
    printcolumn = r#"{"name":"Username", "type":"string", "jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"Namespace", "type":"string", "jsonPath":".status.namespace"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevServerUserSpec {
    /// DNS-label-compatible username.
    pub username: String,

    /// Per-user resource quota overrides, e.g.
    /// `{"requests.cpu": "16", "persistentvolumeclaims": "10"}`.
    /// Defaults apply for keys not present here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quota: BTreeMap<String, String>,
}

/// DevServerUser status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevServerUserStatus {
    /// Namespace provisioned for this user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Provisioning conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DevServerUser {
    /// The namespace provisioned for this user.
    pub fn user_namespace(&self) -> String {
        format!("dev-{}", self.spec.username)
    }

    /// The service account provisioned for this user.
    pub fn service_account_name(&self) -> String {
        format!("{}-sa", self.spec.username)
    }
}
