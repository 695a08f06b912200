//! DevServer controller.
//!
//! Reconciles DevServer resources into a home volume claim, a workload
//! (Deployment or StatefulSet), SSH plumbing and, in distributed mode, a
//! headless peer-discovery service. Deletion runs through a finalizer;
//! owned children are garbage-collected through their owner references.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::ResourceExt;

use super::{action_for, Context};
use crate::crd::{
    clear_condition, upsert_condition, DevServer, DevServerFlavor, DevServerMode, DevServerPhase,
    DevServerStatus,
};
use crate::duration::parse_duration;
use crate::error::{OperatorError, OperatorResult};
use crate::resources;

/// Finalizer owned by this engine on every DevServer.
pub const FINALIZER: &str = "devserver.devservers.io/finalizer";

/// Field manager for server-side apply patches.
const MANAGER: &str = "devserver-operator";

/// Reconcile a DevServer resource.
pub async fn reconcile_devserver(ds: Arc<DevServer>, ctx: Arc<Context>) -> OperatorResult<Action> {
    let namespace = ds
        .namespace()
        .ok_or_else(|| OperatorError::ValidationError("DevServer must be namespaced".into()))?;
    let api: Api<DevServer> = Api::namespaced(ctx.client.clone(), &namespace);

    if ds.metadata.deletion_timestamp.is_none()
        && !ds.finalizers().contains(&FINALIZER.to_string())
    {
        ctx.publish(
            ds.as_ref(),
            EventType::Normal,
            "FinalizerAdded",
            format!("Adding finalizer {FINALIZER}"),
        )
        .await;
    }

    let deadline = ctx.config.reconcile_deadline;
    let result = tokio::time::timeout(
        deadline,
        finalizer(&api, FINALIZER, ds, |event| async {
            match event {
                Finalizer::Apply(ds) => apply(ds, ctx.clone()).await,
                Finalizer::Cleanup(ds) => cleanup(ds, ctx.clone()).await,
            }
        }),
    )
    .await
    .map_err(|_| OperatorError::DeadlineExceeded)?;

    result.map_err(|e| OperatorError::FinalizerError(e.to_string()))
}

/// Handle errors during reconciliation.
pub fn error_policy(ds: Arc<DevServer>, error: &OperatorError, _ctx: Arc<Context>) -> Action {
    tracing::error!(
        name = %ds.name_any(),
        namespace = %ds.namespace().unwrap_or_default(),
        error = %error,
        "DevServer reconciliation error"
    );
    action_for(error)
}

/// Apply path: drive the DevServer toward its desired state.
async fn apply(ds: Arc<DevServer>, ctx: Arc<Context>) -> OperatorResult<Action> {
    let name = ds.name_any();
    let namespace = ds.namespace().unwrap_or_default();

    tracing::info!(
        name = %name,
        namespace = %namespace,
        mode = ?ds.spec.mode,
        flavor = %ds.spec.flavor,
        "Reconciling DevServer"
    );

    let api: Api<DevServer> = Api::namespaced(ctx.client.clone(), &namespace);

    // Materialize timeToLive into an absolute expiration, exactly once.
    if let Some(lifecycle) = &ds.spec.lifecycle {
        if let (Some(ttl), None) = (&lifecycle.time_to_live, &lifecycle.expiration_time) {
            let duration = match parse_duration(ttl) {
                Ok(duration) => duration,
                Err(err) => {
                    tracing::warn!(name = %name, ttl = %ttl, "Invalid timeToLive");
                    let mut status = ds.status.clone().unwrap_or_default();
                    status.phase = DevServerPhase::Failed;
                    status.ready = false;
                    upsert_condition(
                        &mut status.conditions,
                        "Ready",
                        "False",
                        "InvalidDuration",
                        &err.to_string(),
                    );
                    patch_status(&api, &name, status).await?;
                    ctx.publish(ds.as_ref(), EventType::Warning, "Failed", err.to_string())
                        .await;
                    // Requeues resume when the spec changes.
                    return Ok(Action::await_change());
                }
            };

            let created = ds
                .creation_timestamp()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now);
            let expiration = Time(
                created
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            );

            tracing::info!(name = %name, expiration = %expiration.0, "Setting expirationTime from timeToLive");
            let patch = serde_json::json!({
                "spec": {"lifecycle": {"expirationTime": expiration}}
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            return Ok(Action::requeue(Duration::ZERO));
        }
    }

    // Expired servers are deleted; the finalizer path takes over on the
    // next reconcile.
    if let Some(expiration) = expiration_of(&ds) {
        if Utc::now() >= expiration.0 {
            tracing::info!(name = %name, expiration = %expiration.0, "DevServer has expired, deleting");
            ctx.publish(
                ds.as_ref(),
                EventType::Normal,
                "Expired",
                format!("Expired at {}", expiration.0.to_rfc3339()),
            )
            .await;
            match api.delete(&name, &Default::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(err)) if err.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(Action::await_change());
        }
    }

    // Resolve the flavor; a missing flavor is a recoverable precondition.
    let flavors: Api<DevServerFlavor> = Api::all(ctx.client.clone());
    let flavor = match flavors.get_opt(&ds.spec.flavor).await? {
        Some(flavor) => flavor,
        None => {
            tracing::warn!(name = %name, flavor = %ds.spec.flavor, "DevServerFlavor not found");
            let mut status = ds.status.clone().unwrap_or_default();
            status.phase = DevServerPhase::Failed;
            status.ready = false;
            upsert_condition(
                &mut status.conditions,
                "Ready",
                "False",
                "FlavorNotFound",
                &format!("DevServerFlavor '{}' not found", ds.spec.flavor),
            );
            patch_status(&api, &name, status).await?;
            ctx.publish(
                ds.as_ref(),
                EventType::Warning,
                "FlavorNotFound",
                format!("DevServerFlavor '{}' not found", ds.spec.flavor),
            )
            .await;
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    };

    // Contradictory distributed specs never converge; fail until the
    // spec generation changes.
    if ds.spec.mode == DevServerMode::Distributed && ds.world_size() < 1 {
        let message = format!("worldSize must be at least 1, got {}", ds.world_size());
        let mut status = ds.status.clone().unwrap_or_default();
        status.phase = DevServerPhase::Failed;
        status.ready = false;
        upsert_condition(
            &mut status.conditions,
            "Ready",
            "False",
            "InvalidWorldSize",
            &message,
        );
        patch_status(&api, &name, status).await?;
        ctx.publish(ds.as_ref(), EventType::Warning, "Failed", message).await;
        return Ok(Action::await_change());
    }

    // The shared claim must pre-exist; like the flavor it is a
    // precondition, not a hard failure.
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    if let Some(shared) = &ds.spec.shared_volume_claim_name {
        if pvcs.get_opt(shared).await?.is_none() {
            let mut status = ds.status.clone().unwrap_or_default();
            status.phase = DevServerPhase::Pending;
            status.ready = false;
            upsert_condition(
                &mut status.conditions,
                "Ready",
                "False",
                "SharedClaimMissing",
                &format!("Shared volume claim '{shared}' not found"),
            );
            patch_status(&api, &name, status).await?;
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    }

    // Guard immutable fields: the stored values win and a Degraded
    // condition reports the rejected change.
    let mut effective = (*ds).clone();
    let mut degraded: Vec<(String, String)> = Vec::new();

    if let Some(current_pvc) = pvcs.get_opt(&resources::home_pvc_name(&ds)).await? {
        if let Some(stored) = storage_request_of(&current_pvc) {
            if stored != ds.spec.persistent_home_size {
                degraded.push((
                    "ImmutableField".to_string(),
                    format!(
                        "persistentHomeSize cannot change from {stored} to {}; keeping {stored}",
                        ds.spec.persistent_home_size
                    ),
                ));
                effective.spec.persistent_home_size = stored;
            }
        }
    }

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let existing_shared = match ds.spec.mode {
        DevServerMode::Standalone => deployments
            .get_opt(&name)
            .await?
            .and_then(|d| shared_claim_of_pod(d.spec.and_then(|s| s.template.spec))),
        DevServerMode::Distributed => statefulsets
            .get_opt(&name)
            .await?
            .and_then(|s| shared_claim_of_pod(s.spec.and_then(|s| s.template.spec))),
    };
    if let Some(stored) = existing_shared {
        if ds.spec.shared_volume_claim_name.as_deref() != Some(stored.as_str()) {
            degraded.push((
                "ImmutableField".to_string(),
                format!("sharedVolumeClaimName cannot change after first reconcile; keeping {stored}"),
            ));
            effective.spec.shared_volume_claim_name = Some(stored);
        }
    }

    if let Some(lifecycle) = &ds.spec.lifecycle {
        if lifecycle.auto_shutdown == Some(true) && lifecycle.idle_timeout.is_some() {
            degraded.push((
                "IdleShutdownUnsupported".to_string(),
                "autoShutdown with idleTimeout has no defined transition; ignoring".to_string(),
            ));
        }
    }

    // Children, in dependency order.
    if effective.spec.enable_ssh {
        ensure_hostkeys(&ctx, &effective).await?;
    }
    ensure_configmap(&ctx, &effective).await?;

    let (desired_replicas, ready_replicas) = match effective.spec.mode {
        DevServerMode::Standalone => {
            ensure_pvc(&ctx, &effective, &pvcs).await?;
            ensure_deployment(&ctx, &effective, &flavor, &deployments).await?;
            if effective.spec.enable_ssh {
                ensure_service(&ctx, &effective, resources::build_ssh_service(&effective)).await?;
            }
            let ready = deployments
                .get_opt(&name)
                .await?
                .and_then(|d| d.status)
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            (1, ready)
        }
        DevServerMode::Distributed => {
            ensure_service(&ctx, &effective, resources::build_headless_service(&effective)).await?;
            ensure_statefulset(&ctx, &effective, &flavor, &statefulsets).await?;
            if effective.spec.enable_ssh {
                ensure_service(&ctx, &effective, resources::build_ssh_service(&effective)).await?;
            }
            let ready = statefulsets
                .get_opt(&name)
                .await?
                .and_then(|s| s.status)
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            (effective.world_size(), ready)
        }
    };

    // Project status from the observed children.
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let pod_list = pods
        .list(&ListParams::default().labels(&format!("app=devserver,devserver={name}")))
        .await?;
    let pod_names: Vec<String> = pod_list.iter().map(|p| p.name_any()).collect();

    let previous = ds.status.clone().unwrap_or_default();
    let was_running = previous.phase == DevServerPhase::Running;
    let all_ready = ready_replicas >= desired_replicas && !pod_names.is_empty();

    let mut status = DevServerStatus {
        phase: if all_ready {
            DevServerPhase::Running
        } else {
            DevServerPhase::Pending
        },
        ready: all_ready,
        pod_names,
        start_time: previous.start_time.clone(),
        last_idle_time: previous.last_idle_time.clone(),
        conditions: previous.conditions.clone(),
        ..Default::default()
    };

    if all_ready && status.start_time.is_none() {
        status.start_time = Some(Time(Utc::now()));
    }

    if effective.spec.enable_ssh {
        let service_name = resources::ssh_service_name(&effective);
        status.ssh_endpoint = Some(format!("{service_name}.{namespace}.svc:22"));
        status.service_name = Some(service_name);
    }

    if all_ready {
        upsert_condition(
            &mut status.conditions,
            "Ready",
            "True",
            "AllChildrenReady",
            &format!("{ready_replicas}/{desired_replicas} replicas ready"),
        );
    } else {
        upsert_condition(
            &mut status.conditions,
            "Ready",
            "False",
            "ChildrenPending",
            &format!("{ready_replicas}/{desired_replicas} replicas ready"),
        );
    }

    let had_degraded = previous
        .conditions
        .iter()
        .any(|c| c.condition_type == "Degraded" && c.status == "True");
    if degraded.is_empty() {
        clear_condition(&mut status.conditions, "Degraded");
    } else {
        let (reason, message) = &degraded[0];
        upsert_condition(&mut status.conditions, "Degraded", "True", reason, message);
        if !had_degraded {
            ctx.publish(ds.as_ref(), EventType::Warning, "Degraded", message.clone())
                .await;
        }
    }

    patch_status(&api, &name, status).await?;

    if all_ready && !was_running {
        ctx.publish(
            ds.as_ref(),
            EventType::Normal,
            "Ready",
            format!("DevServer {name} is running"),
        )
        .await;
    }

    Ok(Action::requeue(compute_requeue(
        expiration_of(&ds).as_ref(),
        Utc::now(),
        ctx.config.default_requeue,
    )))
}

/// Cleanup path: children are garbage-collected through owner references,
/// so only bookkeeping remains. Tolerates children that are already gone.
async fn cleanup(ds: Arc<DevServer>, ctx: Arc<Context>) -> OperatorResult<Action> {
    let name = ds.name_any();
    let namespace = ds.namespace().unwrap_or_default();
    tracing::info!(name = %name, namespace = %namespace, "DevServer terminating");

    // Best effort: the object may vanish before the write lands.
    let api: Api<DevServer> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut status = ds.status.clone().unwrap_or_default();
    status.phase = DevServerPhase::Terminating;
    status.ready = false;
    if let Err(err) = patch_status(&api, &name, status).await {
        tracing::debug!(name = %name, error = %err, "Skipping terminal status write");
    }

    ctx.publish(
        ds.as_ref(),
        EventType::Normal,
        "Terminating",
        format!("DevServer {name} and its children are being removed"),
    )
    .await;

    Ok(Action::await_change())
}

fn expiration_of(ds: &DevServer) -> Option<Time> {
    ds.spec
        .lifecycle
        .as_ref()
        .and_then(|l| l.expiration_time.clone())
}

/// Requeue no later than the expiration instant, capped at the default.
fn compute_requeue(
    expiration: Option<&Time>,
    now: chrono::DateTime<Utc>,
    default_requeue: Duration,
) -> Duration {
    match expiration {
        Some(expiration) => {
            let remaining = (expiration.0 - now).to_std().unwrap_or(Duration::ZERO);
            remaining.min(default_requeue)
        }
        None => default_requeue,
    }
}

fn storage_request_of(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.clone())
}

fn shared_claim_of_pod(pod: Option<k8s_openapi::api::core::v1::PodSpec>) -> Option<String> {
    pod?.volumes?
        .into_iter()
        .find(|v| v.name == "shared")
        .and_then(|v| v.persistent_volume_claim)
        .map(|c| c.claim_name)
}

async fn patch_status(
    api: &Api<DevServer>,
    name: &str,
    status: DevServerStatus,
) -> OperatorResult<()> {
    let patch = serde_json::json!({"status": status});
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Ensure the home volume claim exists. The claim spec is never patched;
/// only a missing owner reference is repaired.
async fn ensure_pvc(
    ctx: &Context,
    ds: &DevServer,
    pvcs: &Api<PersistentVolumeClaim>,
) -> OperatorResult<()> {
    let desired = resources::build_home_pvc(ds);
    let pvc_name = desired.metadata.name.clone().unwrap_or_default();

    match pvcs.get_opt(&pvc_name).await? {
        Some(existing) => {
            let owned = existing
                .metadata
                .owner_references
                .as_ref()
                .map(|refs| refs.iter().any(|r| r.controller == Some(true)))
                .unwrap_or(false);
            if !owned {
                tracing::info!(name = %pvc_name, "Repairing owner reference on volume claim");
                let patch = serde_json::json!({
                    "metadata": {"ownerReferences": desired.metadata.owner_references}
                });
                pvcs.patch(&pvc_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
        }
        None => {
            tracing::info!(name = %pvc_name, "Creating volume claim");
            pvcs.create(&PostParams::default(), &desired).await?;
            ctx.publish(
                ds,
                EventType::Normal,
                "ChildCreated",
                format!("Created PersistentVolumeClaim {pvc_name}"),
            )
            .await;
        }
    }
    Ok(())
}

/// Ensure the host-key secret exists. Generated at most once; an existing
/// secret is never regenerated or patched.
async fn ensure_hostkeys(ctx: &Context, ds: &DevServer) -> OperatorResult<()> {
    let namespace = ds.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let secret_name = resources::hostkeys_secret_name(ds);

    if secrets.get_opt(&secret_name).await?.is_some() {
        return Ok(());
    }

    tracing::info!(name = %secret_name, "Generating SSH host keys");
    let (private, public) = resources::generate_host_keys()?;
    let secret = resources::build_hostkeys_secret(ds, private, public);

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            ctx.publish(
                ds,
                EventType::Normal,
                "ChildCreated",
                format!("Created Secret {secret_name}"),
            )
            .await;
            Ok(())
        }
        // Lost a create race; the winner's keys stand.
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn ensure_configmap(ctx: &Context, ds: &DevServer) -> OperatorResult<()> {
    let Some(desired) = resources::build_configmap(ds) else {
        return Ok(());
    };
    let namespace = ds.namespace().unwrap_or_default();
    let configmaps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    let cm_name = desired.metadata.name.clone().unwrap_or_default();

    match configmaps.get_opt(&cm_name).await? {
        Some(existing) if existing.data == desired.data => {}
        Some(_) => {
            tracing::info!(name = %cm_name, "Patching ConfigMap");
            configmaps
                .patch(
                    &cm_name,
                    &PatchParams::apply(MANAGER).force(),
                    &Patch::Apply(&desired),
                )
                .await?;
            ctx.publish(
                ds,
                EventType::Normal,
                "ChildPatched",
                format!("Patched ConfigMap {cm_name}"),
            )
            .await;
        }
        None => {
            tracing::info!(name = %cm_name, "Creating ConfigMap");
            configmaps.create(&PostParams::default(), &desired).await?;
            ctx.publish(
                ds,
                EventType::Normal,
                "ChildCreated",
                format!("Created ConfigMap {cm_name}"),
            )
            .await;
        }
    }
    Ok(())
}

async fn ensure_deployment(
    ctx: &Context,
    ds: &DevServer,
    flavor: &DevServerFlavor,
    deployments: &Api<Deployment>,
) -> OperatorResult<()> {
    let desired = resources::build_deployment(ds, flavor);
    let deploy_name = desired.metadata.name.clone().unwrap_or_default();

    match deployments.get_opt(&deploy_name).await? {
        Some(existing) => {
            let current = workload_fingerprint(
                existing.spec.as_ref().and_then(|s| s.replicas),
                existing.metadata.labels.as_ref(),
                existing.spec.as_ref().map(|s| &s.template),
            );
            let wanted = workload_fingerprint(
                desired.spec.as_ref().and_then(|s| s.replicas),
                desired.metadata.labels.as_ref(),
                desired.spec.as_ref().map(|s| &s.template),
            );
            if current != wanted {
                tracing::info!(name = %deploy_name, "Patching Deployment");
                deployments
                    .patch(
                        &deploy_name,
                        &PatchParams::apply(MANAGER).force(),
                        &Patch::Apply(&desired),
                    )
                    .await?;
                ctx.publish(
                    ds,
                    EventType::Normal,
                    "ChildPatched",
                    format!("Patched Deployment {deploy_name}"),
                )
                .await;
            }
        }
        None => {
            tracing::info!(name = %deploy_name, "Creating Deployment");
            deployments.create(&PostParams::default(), &desired).await?;
            ctx.publish(
                ds,
                EventType::Normal,
                "ChildCreated",
                format!("Created Deployment {deploy_name}"),
            )
            .await;
        }
    }
    Ok(())
}

async fn ensure_statefulset(
    ctx: &Context,
    ds: &DevServer,
    flavor: &DevServerFlavor,
    statefulsets: &Api<StatefulSet>,
) -> OperatorResult<()> {
    let desired = resources::build_statefulset(ds, flavor);
    let sts_name = desired.metadata.name.clone().unwrap_or_default();

    match statefulsets.get_opt(&sts_name).await? {
        Some(existing) => {
            let current = workload_fingerprint(
                existing.spec.as_ref().and_then(|s| s.replicas),
                existing.metadata.labels.as_ref(),
                existing.spec.as_ref().map(|s| &s.template),
            );
            let wanted = workload_fingerprint(
                desired.spec.as_ref().and_then(|s| s.replicas),
                desired.metadata.labels.as_ref(),
                desired.spec.as_ref().map(|s| &s.template),
            );
            if current != wanted {
                tracing::info!(name = %sts_name, "Patching StatefulSet");
                statefulsets
                    .patch(
                        &sts_name,
                        &PatchParams::apply(MANAGER).force(),
                        &Patch::Apply(&desired),
                    )
                    .await?;
                ctx.publish(
                    ds,
                    EventType::Normal,
                    "ChildPatched",
                    format!("Patched StatefulSet {sts_name}"),
                )
                .await;
            }
        }
        None => {
            tracing::info!(name = %sts_name, "Creating StatefulSet");
            statefulsets.create(&PostParams::default(), &desired).await?;
            ctx.publish(
                ds,
                EventType::Normal,
                "ChildCreated",
                format!("Created StatefulSet {sts_name}"),
            )
            .await;
        }
    }
    Ok(())
}

/// Ensure a service exists and matches on its mutable fields. The cluster
/// IP is never touched.
async fn ensure_service(ctx: &Context, ds: &DevServer, desired: Service) -> OperatorResult<()> {
    let namespace = ds.namespace().unwrap_or_default();
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let svc_name = desired.metadata.name.clone().unwrap_or_default();

    match services.get_opt(&svc_name).await? {
        Some(existing) => {
            if service_fingerprint(&existing) != service_fingerprint(&desired) {
                tracing::info!(name = %svc_name, "Patching Service");
                services
                    .patch(
                        &svc_name,
                        &PatchParams::apply(MANAGER).force(),
                        &Patch::Apply(&desired),
                    )
                    .await?;
                ctx.publish(
                    ds,
                    EventType::Normal,
                    "ChildPatched",
                    format!("Patched Service {svc_name}"),
                )
                .await;
            }
        }
        None => {
            tracing::info!(name = %svc_name, "Creating Service");
            services.create(&PostParams::default(), &desired).await?;
            ctx.publish(
                ds,
                EventType::Normal,
                "ChildCreated",
                format!("Created Service {svc_name}"),
            )
            .await;
        }
    }
    Ok(())
}

/// Project a workload onto the fields this operator manages, so that
/// server-populated defaults do not read as drift.
fn workload_fingerprint(
    replicas: Option<i32>,
    labels: Option<&BTreeMap<String, String>>,
    template: Option<&k8s_openapi::api::core::v1::PodTemplateSpec>,
) -> serde_json::Value {
    let pod = template.and_then(|t| t.spec.as_ref());
    let container = pod.and_then(|p| p.containers.first());

    let volumes: Vec<(String, Option<String>)> = pod
        .and_then(|p| p.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .map(|v| {
                    let source = v
                        .persistent_volume_claim
                        .as_ref()
                        .map(|c| c.claim_name.clone())
                        .or_else(|| v.config_map.as_ref().map(|c| c.name.clone()))
                        .or_else(|| v.secret.as_ref().and_then(|s| s.secret_name.clone()));
                    (v.name.clone(), source)
                })
                .collect()
        })
        .unwrap_or_default();

    serde_json::json!({
        "replicas": replicas,
        "labels": labels,
        "image": container.and_then(|c| c.image.clone()),
        "command": container.and_then(|c| c.command.clone()),
        "args": container.and_then(|c| c.args.clone()),
        "env": container.and_then(|c| c.env.clone()),
        "resources": container.and_then(|c| c.resources.clone()),
        "volumeMounts": container.and_then(|c| c.volume_mounts.clone()),
        "volumes": volumes,
        "nodeSelector": pod.and_then(|p| p.node_selector.clone()),
        "tolerations": pod.and_then(|p| p.tolerations.clone()),
    })
}

/// Mutable identity of a service: selector, ports and labels.
fn service_fingerprint(svc: &Service) -> serde_json::Value {
    let spec = svc.spec.as_ref();
    let ports: Vec<(Option<String>, i32, Option<String>)> = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| (p.name.clone(), p.port, p.protocol.clone()))
                .collect()
        })
        .unwrap_or_default();

    serde_json::json!({
        "labels": svc.metadata.labels,
        "selector": spec.and_then(|s| s.selector.clone()),
        "ports": ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testutil;

    #[test]
    fn requeue_defaults_without_expiration() {
        let requeue = compute_requeue(None, Utc::now(), Duration::from_secs(1800));
        assert_eq!(requeue, Duration::from_secs(1800));
    }

    #[test]
    fn requeue_tracks_a_near_expiration() {
        let now = Utc::now();
        let expiration = Time(now + chrono::Duration::seconds(60));
        let requeue = compute_requeue(Some(&expiration), now, Duration::from_secs(1800));
        assert!(requeue <= Duration::from_secs(60));
        assert!(requeue >= Duration::from_secs(58));
    }

    #[test]
    fn requeue_is_zero_once_expired() {
        let now = Utc::now();
        let expiration = Time(now - chrono::Duration::seconds(5));
        let requeue = compute_requeue(Some(&expiration), now, Duration::from_secs(1800));
        assert_eq!(requeue, Duration::ZERO);
    }

    #[test]
    fn requeue_is_capped_at_the_default() {
        let now = Utc::now();
        let expiration = Time(now + chrono::Duration::hours(24));
        let requeue = compute_requeue(Some(&expiration), now, Duration::from_secs(1800));
        assert_eq!(requeue, Duration::from_secs(1800));
    }

    #[test]
    fn storage_request_is_read_from_the_claim() {
        let ds = testutil::standalone("demo");
        let pvc = crate::resources::build_home_pvc(&ds);
        assert_eq!(storage_request_of(&pvc).as_deref(), Some("100Gi"));
    }

    #[test]
    fn shared_claim_is_read_from_the_pod_spec() {
        let mut ds = testutil::standalone("demo");
        ds.spec.shared_volume_claim_name = Some("team-efs".to_string());
        let flavor = DevServerFlavor::new("cpu-small", Default::default());
        let deploy = crate::resources::build_deployment(&ds, &flavor);
        let shared = shared_claim_of_pod(deploy.spec.unwrap().template.spec);
        assert_eq!(shared.as_deref(), Some("team-efs"));
    }

    #[test]
    fn identical_workloads_do_not_read_as_drift() {
        let ds = testutil::standalone("demo");
        let flavor = DevServerFlavor::new("cpu-small", Default::default());
        let a = crate::resources::build_deployment(&ds, &flavor);
        let mut b = crate::resources::build_deployment(&ds, &flavor);

        // Server-populated fields outside the managed projection.
        if let Some(spec) = b.spec.as_mut() {
            spec.progress_deadline_seconds = Some(600);
            if let Some(pod) = spec.template.spec.as_mut() {
                pod.restart_policy = Some("Always".to_string());
                pod.dns_policy = Some("ClusterFirst".to_string());
            }
        }

        let fp = |d: &Deployment| {
            workload_fingerprint(
                d.spec.as_ref().and_then(|s| s.replicas),
                d.metadata.labels.as_ref(),
                d.spec.as_ref().map(|s| &s.template),
            )
        };
        assert_eq!(fp(&a), fp(&b));
    }

    #[test]
    fn image_change_reads_as_drift() {
        let ds = testutil::standalone("demo");
        let flavor = DevServerFlavor::new("cpu-small", Default::default());
        let a = crate::resources::build_deployment(&ds, &flavor);

        let mut changed = ds.clone();
        changed.spec.image = "ubuntu:24.04".to_string();
        let b = crate::resources::build_deployment(&changed, &flavor);

        let fp = |d: &Deployment| {
            workload_fingerprint(
                d.spec.as_ref().and_then(|s| s.replicas),
                d.metadata.labels.as_ref(),
                d.spec.as_ref().map(|s| &s.template),
            )
        };
        assert_ne!(fp(&a), fp(&b));
    }

    #[test]
    fn service_fingerprint_ignores_cluster_ip() {
        let ds = testutil::standalone("demo");
        let a = crate::resources::build_ssh_service(&ds);
        let mut b = crate::resources::build_ssh_service(&ds);
        if let Some(spec) = b.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.42".to_string());
        }
        assert_eq!(service_fingerprint(&a), service_fingerprint(&b));
    }
}
