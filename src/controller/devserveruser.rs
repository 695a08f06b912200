//! DevServerUser controller.
//!
//! Provisions the per-user namespace, service account, RBAC and resource
//! quota. Every child is owned by the DevServerUser so deletion cascades;
//! namespace teardown is accepted as slow and never blocked on.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Namespace, ResourceQuota, ResourceQuotaSpec, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};

use super::{action_for, Context};
use crate::crd::{upsert_condition, DevServerUser, DevServerUserStatus};
use crate::error::{OperatorError, OperatorResult};

/// Name of the per-namespace role granted to every user.
pub const USER_ROLE: &str = "dev-user";

/// Default quota applied when the user spec carries no override for a key.
const DEFAULT_QUOTA: [(&str, &str); 4] = [
    ("requests.cpu", "16"),
    ("requests.memory", "64Gi"),
    ("persistentvolumeclaims", "10"),
    ("services", "20"),
];

/// Reconcile a DevServerUser resource.
pub async fn reconcile_user(user: Arc<DevServerUser>, ctx: Arc<Context>) -> OperatorResult<Action> {
    let deadline = ctx.config.reconcile_deadline;
    tokio::time::timeout(deadline, apply(user, ctx))
        .await
        .map_err(|_| OperatorError::DeadlineExceeded)?
}

async fn apply(user: Arc<DevServerUser>, ctx: Arc<Context>) -> OperatorResult<Action> {
    let name = user.name_any();
    let namespace = user.user_namespace();

    tracing::info!(
        name = %name,
        username = %user.spec.username,
        namespace = %namespace,
        "Reconciling DevServerUser"
    );

    validate_username(&user.spec.username)?;

    ensure_namespace(&ctx, &user).await?;
    ensure_service_account(&ctx, &user).await?;
    ensure_role(&ctx, &user).await?;
    ensure_role_binding(&ctx, &user).await?;
    ensure_quota(&ctx, &user).await?;

    let api: Api<DevServerUser> = Api::all(ctx.client.clone());
    let mut status = user.status.clone().unwrap_or_default();
    let newly_ready = !status
        .conditions
        .iter()
        .any(|c| c.condition_type == "Ready" && c.status == "True");
    status.namespace = Some(namespace.clone());
    upsert_condition(
        &mut status.conditions,
        "Ready",
        "True",
        "Provisioned",
        &format!("Namespace {namespace} and RBAC ensured"),
    );
    patch_status(&api, &name, status).await?;

    if newly_ready {
        ctx.publish(
            user.as_ref(),
            EventType::Normal,
            "Ready",
            format!("User namespace {namespace} provisioned"),
        )
        .await;
    }

    Ok(Action::requeue(ctx.config.resync_period))
}

/// Handle errors during user reconciliation.
pub fn error_policy(user: Arc<DevServerUser>, error: &OperatorError, _ctx: Arc<Context>) -> Action {
    tracing::error!(
        name = %user.name_any(),
        error = %error,
        "DevServerUser reconciliation error"
    );
    action_for(error)
}

fn validate_username(username: &str) -> OperatorResult<()> {
    let valid = !username.is_empty()
        && username.len() <= 53
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !username.starts_with('-')
        && !username.ends_with('-');
    if !valid {
        return Err(OperatorError::ValidationError(format!(
            "username '{username}' is not a DNS label"
        )));
    }
    Ok(())
}

fn owner_references(user: &DevServerUser) -> Vec<OwnerReference> {
    user.controller_owner_ref(&()).into_iter().collect()
}

fn user_labels(user: &DevServerUser) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("devserver.io/user".to_string(), user.spec.username.clone()),
        ("devserver.io/managed".to_string(), "true".to_string()),
    ])
}

fn build_namespace(user: &DevServerUser) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(user.user_namespace()),
            labels: Some(user_labels(user)),
            owner_references: Some(owner_references(user)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn build_service_account(user: &DevServerUser) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(user.service_account_name()),
            namespace: Some(user.user_namespace()),
            labels: Some(user_labels(user)),
            owner_references: Some(owner_references(user)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn build_role(user: &DevServerUser) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(USER_ROLE.to_string()),
            namespace: Some(user.user_namespace()),
            labels: Some(user_labels(user)),
            owner_references: Some(owner_references(user)),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["devserver.io".to_string()]),
                resources: Some(vec!["devservers".to_string()]),
                verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
                    .map(String::from)
                    .to_vec(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(
                    [
                        "pods",
                        "services",
                        "persistentvolumeclaims",
                        "configmaps",
                        "secrets",
                    ]
                    .map(String::from)
                    .to_vec(),
                ),
                verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
                    .map(String::from)
                    .to_vec(),
                ..Default::default()
            },
        ]),
    }
}

fn build_role_binding(user: &DevServerUser) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(USER_ROLE.to_string()),
            namespace: Some(user.user_namespace()),
            labels: Some(user_labels(user)),
            owner_references: Some(owner_references(user)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: USER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: user.service_account_name(),
            namespace: Some(user.user_namespace()),
            ..Default::default()
        }]),
    }
}

fn build_quota(user: &DevServerUser) -> ResourceQuota {
    let mut hard: BTreeMap<String, Quantity> = DEFAULT_QUOTA
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect();
    for (key, value) in &user.spec.quota {
        hard.insert(key.clone(), Quantity(value.clone()));
    }

    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(format!("{}-quota", user.user_namespace())),
            namespace: Some(user.user_namespace()),
            labels: Some(user_labels(user)),
            owner_references: Some(owner_references(user)),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn ensure_namespace(ctx: &Context, user: &DevServerUser) -> OperatorResult<()> {
    let desired = build_namespace(user);
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let ns_name = desired.metadata.name.clone().unwrap_or_default();

    match namespaces.get_opt(&ns_name).await? {
        Some(_) => {}
        None => {
            tracing::info!(namespace = %ns_name, "Creating user namespace");
            match namespaces.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    ctx.publish(
                        user,
                        EventType::Normal,
                        "ChildCreated",
                        format!("Created Namespace {ns_name}"),
                    )
                    .await;
                }
                // A terminating namespace can race its own recreation.
                Err(kube::Error::Api(err)) if err.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

async fn ensure_service_account(ctx: &Context, user: &DevServerUser) -> OperatorResult<()> {
    let desired = build_service_account(user);
    let api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &user.user_namespace());
    let sa_name = desired.metadata.name.clone().unwrap_or_default();

    if api.get_opt(&sa_name).await?.is_none() {
        tracing::info!(name = %sa_name, "Creating service account");
        match api.create(&PostParams::default(), &desired).await {
            Ok(_) => {
                ctx.publish(
                    user,
                    EventType::Normal,
                    "ChildCreated",
                    format!("Created ServiceAccount {sa_name}"),
                )
                .await;
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn ensure_role(ctx: &Context, user: &DevServerUser) -> OperatorResult<()> {
    let desired = build_role(user);
    let api: Api<Role> = Api::namespaced(ctx.client.clone(), &user.user_namespace());

    match api.get_opt(USER_ROLE).await? {
        Some(existing) if existing.rules == desired.rules => {}
        Some(_) => {
            tracing::info!(name = USER_ROLE, "Patching role");
            api.patch(
                USER_ROLE,
                &PatchParams::apply("devserver-operator").force(),
                &Patch::Apply(&desired),
            )
            .await?;
            ctx.publish(
                user,
                EventType::Normal,
                "ChildPatched",
                format!("Patched Role {USER_ROLE}"),
            )
            .await;
        }
        None => {
            tracing::info!(name = USER_ROLE, "Creating role");
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    ctx.publish(
                        user,
                        EventType::Normal,
                        "ChildCreated",
                        format!("Created Role {USER_ROLE}"),
                    )
                    .await;
                }
                Err(kube::Error::Api(err)) if err.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

async fn ensure_role_binding(ctx: &Context, user: &DevServerUser) -> OperatorResult<()> {
    let desired = build_role_binding(user);
    let api: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), &user.user_namespace());

    match api.get_opt(USER_ROLE).await? {
        Some(existing) if existing.subjects == desired.subjects => {}
        Some(_) => {
            tracing::info!(name = USER_ROLE, "Patching role binding");
            api.patch(
                USER_ROLE,
                &PatchParams::apply("devserver-operator").force(),
                &Patch::Apply(&desired),
            )
            .await?;
        }
        None => {
            tracing::info!(name = USER_ROLE, "Creating role binding");
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    ctx.publish(
                        user,
                        EventType::Normal,
                        "ChildCreated",
                        format!("Created RoleBinding {USER_ROLE}"),
                    )
                    .await;
                }
                Err(kube::Error::Api(err)) if err.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

async fn ensure_quota(ctx: &Context, user: &DevServerUser) -> OperatorResult<()> {
    let desired = build_quota(user);
    let api: Api<ResourceQuota> = Api::namespaced(ctx.client.clone(), &user.user_namespace());
    let quota_name = desired.metadata.name.clone().unwrap_or_default();

    let desired_hard = desired.spec.as_ref().and_then(|s| s.hard.clone());
    match api.get_opt(&quota_name).await? {
        Some(existing) if existing.spec.as_ref().and_then(|s| s.hard.clone()) == desired_hard => {}
        Some(_) => {
            tracing::info!(name = %quota_name, "Patching resource quota");
            api.patch(
                &quota_name,
                &PatchParams::apply("devserver-operator").force(),
                &Patch::Apply(&desired),
            )
            .await?;
            ctx.publish(
                user,
                EventType::Normal,
                "ChildPatched",
                format!("Patched ResourceQuota {quota_name}"),
            )
            .await;
        }
        None => {
            tracing::info!(name = %quota_name, "Creating resource quota");
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    ctx.publish(
                        user,
                        EventType::Normal,
                        "ChildCreated",
                        format!("Created ResourceQuota {quota_name}"),
                    )
                    .await;
                }
                Err(kube::Error::Api(err)) if err.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

async fn patch_status(
    api: &Api<DevServerUser>,
    name: &str,
    status: DevServerUserStatus,
) -> OperatorResult<()> {
    let patch = serde_json::json!({"status": status});
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(username: &str) -> DevServerUser {
        let mut user = DevServerUser::new(
            username,
            serde_json::from_value(serde_json::json!({"username": username})).unwrap(),
        );
        user.metadata.uid = Some("3333-4444".to_string());
        user
    }

    #[test]
    fn username_validation() {
        assert!(validate_username("bob").is_ok());
        assert!(validate_username("bob-2").is_ok());
        for bad in ["", "Bob", "bob_2", "-bob", "bob-", "bob.smith"] {
            assert!(validate_username(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn namespace_carries_user_labels_and_owner() {
        let ns = build_namespace(&user("bob"));
        assert_eq!(ns.metadata.name.as_deref(), Some("dev-bob"));
        let labels = ns.metadata.labels.unwrap();
        assert_eq!(labels["devserver.io/user"], "bob");
        let owners = ns.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "DevServerUser");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn role_grants_devserver_management() {
        let role = build_role(&user("bob"));
        assert_eq!(role.metadata.name.as_deref(), Some("dev-user"));
        let rules = role.rules.unwrap();
        assert_eq!(rules[0].api_groups, Some(vec!["devserver.io".to_string()]));
        assert!(rules[0].verbs.contains(&"delete".to_string()));
        assert!(rules[1]
            .resources
            .as_ref()
            .unwrap()
            .contains(&"persistentvolumeclaims".to_string()));
    }

    #[test]
    fn role_binding_links_role_to_service_account() {
        let rb = build_role_binding(&user("bob"));
        assert_eq!(rb.role_ref.name, "dev-user");
        let subjects = rb.subjects.unwrap();
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].name, "bob-sa");
        assert_eq!(subjects[0].namespace.as_deref(), Some("dev-bob"));
    }

    #[test]
    fn quota_defaults_apply() {
        let quota = build_quota(&user("bob"));
        assert_eq!(quota.metadata.name.as_deref(), Some("dev-bob-quota"));
        let hard = quota.spec.unwrap().hard.unwrap();
        assert_eq!(hard["requests.cpu"].0, "16");
        assert_eq!(hard["requests.memory"].0, "64Gi");
    }

    #[test]
    fn quota_overrides_replace_defaults() {
        let mut u = user("bob");
        u.spec.quota = BTreeMap::from([("requests.cpu".to_string(), "32".to_string())]);
        let hard = build_quota(&u).spec.unwrap().hard.unwrap();
        assert_eq!(hard["requests.cpu"].0, "32");
        assert_eq!(hard["requests.memory"].0, "64Gi");
    }
}
