//! Custom Resource Definitions managed by the DevServer operator.
//!
//! - [`DevServer`]: one developer environment (namespaced)
//! - [`DevServerFlavor`]: resource envelope template (cluster-scoped)
//! - [`DevServerUser`]: per-user namespace and RBAC binding (cluster-scoped)

mod devserver;
mod devserverflavor;
mod devserveruser;

pub use devserver::{
    DevServer, DevServerMode, DevServerPhase, DevServerSpec, DevServerStatus, DistributedBackend,
    DistributedSpec, LifecycleSpec, SshSpec,
};
pub use devserverflavor::{
    DevServerFlavor, DevServerFlavorSpec, DevServerFlavorStatus, FlavorResources, Toleration,
};
pub use devserveruser::{DevServerUser, DevServerUserSpec, DevServerUserStatus};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status condition shared by all three kinds. Type keys are unique per
/// object; `last_transition_time` only moves when `status` flips.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Available, Degraded, ...).
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown).
    pub status: String,

    /// Last time the condition status changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Machine-readable reason for the condition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Insert or update a condition in place, keeping type keys unique and
/// preserving the transition timestamp when the status is unchanged.
pub fn upsert_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = chrono::Utc::now().to_rfc3339();
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status.to_string();
            existing.reason = Some(reason.to_string());
            existing.message = Some(message.to_string());
        }
        None => conditions.push(Condition {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            last_transition_time: Some(now),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }),
    }
}

/// Remove a condition by type, if present.
pub fn clear_condition(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.condition_type != condition_type);
}
