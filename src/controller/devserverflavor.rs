//! DevServerFlavor controller.
//!
//! Pure validation: a flavor never produces children. The result is
//! published as an `Available` condition on the flavor's status.

use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;

use super::{action_for, Context};
use crate::crd::{upsert_condition, DevServerFlavor, DevServerFlavorSpec, Toleration};
use crate::error::{OperatorError, OperatorResult};
use crate::quantity::parse_quantity;

/// Reconcile a DevServerFlavor resource.
pub async fn reconcile_flavor(
    flavor: Arc<DevServerFlavor>,
    ctx: Arc<Context>,
) -> OperatorResult<Action> {
    let deadline = ctx.config.reconcile_deadline;
    tokio::time::timeout(deadline, apply(flavor, ctx))
        .await
        .map_err(|_| OperatorError::DeadlineExceeded)?
}

async fn apply(flavor: Arc<DevServerFlavor>, ctx: Arc<Context>) -> OperatorResult<Action> {
    let name = flavor.name_any();
    tracing::debug!(name = %name, "Validating DevServerFlavor");

    let verdict = validate_flavor(&flavor.spec);

    let api: Api<DevServerFlavor> = Api::all(ctx.client.clone());
    let mut status = flavor.status.clone().unwrap_or_default();
    match &verdict {
        Ok(()) => upsert_condition(
            &mut status.conditions,
            "Available",
            "True",
            "Valid",
            "Flavor validated",
        ),
        Err(reason) => {
            tracing::warn!(name = %name, reason = %reason, "Flavor validation failed");
            upsert_condition(
                &mut status.conditions,
                "Available",
                "False",
                "Invalid",
                reason,
            );
        }
    }

    let patch = serde_json::json!({"status": status});
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(Action::requeue(ctx.config.resync_period))
}

/// Handle errors during flavor reconciliation.
pub fn error_policy(
    flavor: Arc<DevServerFlavor>,
    error: &OperatorError,
    _ctx: Arc<Context>,
) -> Action {
    tracing::error!(
        name = %flavor.name_any(),
        error = %error,
        "DevServerFlavor reconciliation error"
    );
    action_for(error)
}

/// Check a flavor spec; the error string becomes the condition message.
fn validate_flavor(spec: &DevServerFlavorSpec) -> Result<(), String> {
    for (key, request) in &spec.resources.requests {
        let Some(limit) = spec.resources.limits.get(key) else {
            continue;
        };
        let request_value = parse_quantity(request)
            .ok_or_else(|| format!("request for '{key}' is not a quantity: '{request}'"))?;
        let limit_value = parse_quantity(limit)
            .ok_or_else(|| format!("limit for '{key}' is not a quantity: '{limit}'"))?;
        if request_value > limit_value {
            return Err(format!(
                "request for '{key}' ({request}) exceeds limit ({limit})"
            ));
        }
    }

    for (key, limit) in &spec.resources.limits {
        if parse_quantity(limit).is_none() {
            return Err(format!("limit for '{key}' is not a quantity: '{limit}'"));
        }
    }

    for key in spec.node_selector.keys() {
        if key.is_empty() {
            return Err("nodeSelector contains an empty key".to_string());
        }
    }

    for toleration in &spec.tolerations {
        validate_toleration(toleration)?;
    }

    Ok(())
}

fn validate_toleration(t: &Toleration) -> Result<(), String> {
    match t.operator.as_deref() {
        None | Some("Equal") => {
            if t.key.is_none() {
                return Err("toleration with operator Equal requires a key".to_string());
            }
        }
        Some("Exists") => {
            if t.value.is_some() {
                return Err("toleration with operator Exists must not set a value".to_string());
            }
        }
        Some(other) => return Err(format!("unknown toleration operator '{other}'")),
    }

    match t.effect.as_deref() {
        None | Some("NoSchedule") | Some("PreferNoSchedule") | Some("NoExecute") => Ok(()),
        Some(other) => Err(format!("unknown toleration effect '{other}'")),
    }
}
