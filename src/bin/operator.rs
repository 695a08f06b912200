//! DevServer Kubernetes Operator binary.
//!
//! Runs the controllers for DevServer, DevServerFlavor and DevServerUser
//! custom resources. With `--generate-crds` it prints the CRD schemas as
//! YAML and exits.

use std::sync::Arc;

use clap::Parser;
use devserver_operator::config::OperatorConfig;
use devserver_operator::controller::{
    devserver_error_policy, flavor_error_policy, reconcile_devserver, reconcile_flavor,
    reconcile_user, user_error_policy, Context,
};
use devserver_operator::crd::{DevServer, DevServerFlavor, DevServerUser};
use devserver_operator::leader::LeaseManager;
use devserver_operator::OperatorResult;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devserver_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    let config = OperatorConfig::parse();

    if config.generate_crds {
        generate_crds()?;
        return Ok(());
    }

    tracing::info!("Starting DevServer operator");
    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    // With leader election on, standbys block here until the lease is
    // free. Lease loss later is fatal; the orchestrator restarts us.
    let lease = if config.leader_election {
        let namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let manager = LeaseManager::new(client.clone(), namespace);
        manager.acquire().await?;
        Some(manager)
    } else {
        None
    };

    let ctx = Arc::new(Context::new(client.clone(), config.clone()));

    let lease_renewal = async {
        match lease {
            Some(manager) => manager.run().await,
            None => futures::future::pending::<OperatorResult<()>>().await,
        }
    };

    tokio::select! {
        result = run_devserver_controller(client.clone(), ctx.clone()) => {
            tracing::error!("DevServer controller exited: {:?}", result);
            result?;
        }
        result = run_user_controller(client.clone(), ctx.clone()) => {
            tracing::error!("DevServerUser controller exited: {:?}", result);
            result?;
        }
        result = run_flavor_controller(client.clone(), ctx.clone()) => {
            tracing::error!("DevServerFlavor controller exited: {:?}", result);
            result?;
        }
        result = lease_renewal => {
            tracing::error!("Leader lease lost: {:?}", result);
            result?;
        }
    }

    Ok(())
}

/// Namespaced or cluster-wide API depending on `--watch-namespace`.
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) if !ns.is_empty() => Api::namespaced(client.clone(), ns),
        _ => Api::all(client.clone()),
    }
}

/// Run the DevServer controller. Watches the root kind plus every owned
/// kind so that child mutations map back to their root.
async fn run_devserver_controller(client: Client, ctx: Arc<Context>) -> anyhow::Result<()> {
    tracing::info!("Starting DevServer controller");
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();

    let devservers: Api<DevServer> = scoped_api(&client, namespace);
    let deployments: Api<Deployment> = scoped_api(&client, namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(&client, namespace);
    let services: Api<Service> = scoped_api(&client, namespace);
    let pvcs: Api<PersistentVolumeClaim> = scoped_api(&client, namespace);
    let configmaps: Api<ConfigMap> = scoped_api(&client, namespace);
    let secrets: Api<Secret> = scoped_api(&client, namespace);

    let watcher_config = WatcherConfig::default();

    Controller::new(devservers, watcher_config.clone())
        .with_config(ControllerConfig::default().concurrency(ctx.config.worker_count))
        .owns(deployments, watcher_config.clone())
        .owns(statefulsets, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(pvcs, watcher_config.clone())
        .owns(configmaps, watcher_config.clone())
        .owns(secrets, watcher_config)
        .shutdown_on_signal()
        .run(reconcile_devserver, devserver_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(devserver = %obj.name, ?action, "Reconciled DevServer");
                }
                Err(err) => {
                    tracing::error!(error = %err, "DevServer controller stream error");
                }
            }
        })
        .await;

    Ok(())
}

/// Run the DevServerUser controller.
async fn run_user_controller(client: Client, ctx: Arc<Context>) -> anyhow::Result<()> {
    tracing::info!("Starting DevServerUser controller");
    let users: Api<DevServerUser> = Api::all(client);

    Controller::new(users, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(ctx.config.worker_count))
        .shutdown_on_signal()
        .run(reconcile_user, user_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(user = %obj.name, ?action, "Reconciled DevServerUser");
                }
                Err(err) => {
                    tracing::error!(error = %err, "DevServerUser controller stream error");
                }
            }
        })
        .await;

    Ok(())
}

/// Run the DevServerFlavor controller.
async fn run_flavor_controller(client: Client, ctx: Arc<Context>) -> anyhow::Result<()> {
    tracing::info!("Starting DevServerFlavor controller");
    let flavors: Api<DevServerFlavor> = Api::all(client);

    Controller::new(flavors, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(ctx.config.worker_count))
        .shutdown_on_signal()
        .run(reconcile_flavor, flavor_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(flavor = %obj.name, ?action, "Reconciled DevServerFlavor");
                }
                Err(err) => {
                    tracing::error!(error = %err, "DevServerFlavor controller stream error");
                }
            }
        })
        .await;

    Ok(())
}

/// Print CRD YAML for all managed kinds.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&DevServer::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&DevServerFlavor::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&DevServerUser::crd())?);
    Ok(())
}
