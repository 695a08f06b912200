//! Workload builders: a Deployment for standalone servers, a StatefulSet
//! for distributed ones. Both share the same pod contract.

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretVolumeSource, Toleration as K8sToleration,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::configmap::MASTER_PORT;
use super::{
    configmap_name, devserver_labels, home_pvc_name, hostkeys_secret_name, owner_references,
    peers_service_name,
};
use crate::crd::{DevServer, DevServerFlavor, DevServerMode, Toleration};

fn quantity_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

fn convert_toleration(t: &Toleration) -> K8sToleration {
    K8sToleration {
        key: t.key.clone(),
        operator: t.operator.clone(),
        value: t.value.clone(),
        effect: t.effect.clone(),
        toleration_seconds: t.toleration_seconds,
    }
}

fn mode_str(ds: &DevServer) -> &'static str {
    match ds.spec.mode {
        DevServerMode::Standalone => "standalone",
        DevServerMode::Distributed => "distributed",
    }
}

fn base_env(ds: &DevServer) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "DEVSERVER_OWNER".to_string(),
            value: Some(ds.spec.owner.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "DEVSERVER_MODE".to_string(),
            value: Some(mode_str(ds).to_string()),
            ..Default::default()
        },
    ];

    if ds.spec.enable_ssh {
        if let Some(key) = &ds.spec.ssh.public_key {
            env.push(EnvVar {
                name: "SSH_PUBLIC_KEY".to_string(),
                value: Some(key.clone()),
                ..Default::default()
            });
        }
    }

    env
}

fn distributed_env(ds: &DevServer) -> Vec<EnvVar> {
    let name = ds.name_any();
    let namespace = ds.namespace().unwrap_or_default();
    let peers_svc = peers_service_name(ds);

    let mut env = vec![
        // StatefulSet pods carry their ordinal as a label; the downward
        // API turns it into the process rank.
        EnvVar {
            name: "RANK".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels['apps.kubernetes.io/pod-index']".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "WORLD_SIZE".to_string(),
            value: Some(ds.world_size().to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "MASTER_ADDR".to_string(),
            value: Some(format!("{name}-0.{peers_svc}.{namespace}.svc")),
            ..Default::default()
        },
        EnvVar {
            name: "MASTER_PORT".to_string(),
            value: Some(MASTER_PORT.to_string()),
            ..Default::default()
        },
    ];

    if let Some(dist) = &ds.spec.distributed {
        for (key, value) in &dist.nccl_settings {
            env.push(EnvVar {
                name: key.clone(),
                value: Some(value.clone()),
                ..Default::default()
            });
        }
    }

    env
}

/// Build the shared pod template. `home_from_claim` names an external PVC
/// for the home mount; `None` means the StatefulSet claim template
/// provides it.
fn pod_template(
    ds: &DevServer,
    flavor: &DevServerFlavor,
    home_from_claim: Option<String>,
) -> PodTemplateSpec {
    let name = ds.name_any();
    let labels = devserver_labels(&name);

    let mut volume_mounts = vec![VolumeMount {
        name: "home".to_string(),
        mount_path: "/home/dev".to_string(),
        ..Default::default()
    }];
    let mut volumes = Vec::new();

    if let Some(claim_name) = home_from_claim {
        volumes.push(Volume {
            name: "home".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name,
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if let Some(shared) = &ds.spec.shared_volume_claim_name {
        volume_mounts.push(VolumeMount {
            name: "shared".to_string(),
            mount_path: "/shared".to_string(),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "shared".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: shared.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if ds.spec.enable_ssh {
        volume_mounts.push(VolumeMount {
            name: "sshd-config".to_string(),
            mount_path: "/etc/ssh/sshd_config".to_string(),
            sub_path: Some("sshd_config".to_string()),
            read_only: Some(true),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "host-keys".to_string(),
            mount_path: "/etc/ssh/hostkeys".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "sshd-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: configmap_name(ds),
                ..Default::default()
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "host-keys".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(hostkeys_secret_name(ds)),
                default_mode: Some(0o600),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut env = base_env(ds);
    if ds.spec.mode == DevServerMode::Distributed {
        env.extend(distributed_env(ds));
    }

    let container = Container {
        name: "devserver".to_string(),
        image: Some(ds.spec.image.clone()),
        command: Some(vec!["sleep".to_string()]),
        args: Some(vec!["infinity".to_string()]),
        ports: ds.spec.enable_ssh.then(|| {
            vec![ContainerPort {
                container_port: 22,
                name: Some("ssh".to_string()),
                ..Default::default()
            }]
        }),
        env: Some(env),
        resources: Some(ResourceRequirements {
            requests: quantity_map(&flavor.spec.resources.requests),
            limits: quantity_map(&flavor.spec.resources.limits),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: (!volumes.is_empty()).then_some(volumes),
            node_selector: (!flavor.spec.node_selector.is_empty())
                .then(|| flavor.spec.node_selector.clone()),
            tolerations: (!flavor.spec.tolerations.is_empty())
                .then(|| flavor.spec.tolerations.iter().map(convert_toleration).collect()),
            ..Default::default()
        }),
    }
}

/// Build the standalone Deployment: one replica, home mounted from the
/// `<name>-home` claim.
pub fn build_deployment(ds: &DevServer, flavor: &DevServerFlavor) -> Deployment {
    let name = ds.name_any();
    let labels = devserver_labels(&name);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: ds.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(owner_references(ds)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: pod_template(ds, flavor, Some(home_pvc_name(ds))),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the distributed StatefulSet: ordered replicas = worldSize, one
/// home claim per replica through the claim template.
pub fn build_statefulset(ds: &DevServer, flavor: &DevServerFlavor) -> StatefulSet {
    let name = ds.name_any();
    let labels = devserver_labels(&name);

    let home_claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("home".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(ds.spec.persistent_home_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: ds.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(owner_references(ds)),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(ds.world_size()),
            service_name: Some(peers_service_name(ds)),
            pod_management_policy: Some("OrderedReady".to_string()),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: pod_template(ds, flavor, None),
            volume_claim_templates: Some(vec![home_claim]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use crate::crd::DevServerFlavorSpec;

    fn flavor() -> DevServerFlavor {
        let spec: DevServerFlavorSpec = serde_json::from_value(serde_json::json!({
            "resources": {
                "requests": {"cpu": "2", "memory": "4Gi"},
                "limits": {"cpu": "4", "memory": "8Gi"},
            },
            "nodeSelector": {"pool": "dev"},
            "tolerations": [
                {"key": "dev-only", "operator": "Exists", "effect": "NoSchedule"},
            ],
        }))
        .unwrap();
        DevServerFlavor::new("cpu-small", spec)
    }

    fn distributed(world_size: i32) -> DevServer {
        testutil::devserver(
            "train",
            serde_json::json!({
                "owner": "bob@example.com",
                "flavor": "gpu-large",
                "mode": "distributed",
                "distributed": {
                    "worldSize": world_size,
                    "ncclSettings": {"NCCL_DEBUG": "INFO"},
                },
            }),
        )
    }

    fn container_of_deployment(deploy: &Deployment) -> &Container {
        &deploy
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0]
    }

    #[test]
    fn deployment_has_one_replica_and_the_devserver_selector() {
        let deploy = build_deployment(&testutil::standalone("demo"), &flavor());
        let spec = deploy.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let selector = spec.selector.match_labels.as_ref().unwrap();
        assert_eq!(selector["app"], "devserver");
        assert_eq!(selector["devserver"], "demo");
    }

    #[test]
    fn deployment_copies_the_flavor_envelope() {
        let deploy = build_deployment(&testutil::standalone("demo"), &flavor());
        let pod = deploy.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        assert_eq!(pod.node_selector.as_ref().unwrap()["pool"], "dev");
        assert_eq!(pod.tolerations.as_ref().unwrap()[0].key.as_deref(), Some("dev-only"));

        let resources = container_of_deployment(&deploy).resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "2");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "8Gi");
    }

    #[test]
    fn deployment_mounts_home_from_the_named_claim() {
        let deploy = build_deployment(&testutil::standalone("demo"), &flavor());
        let pod = deploy.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        let home = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "home")
            .unwrap();
        assert_eq!(
            home.persistent_volume_claim.as_ref().unwrap().claim_name,
            "demo-home"
        );

        let mounts = container_of_deployment(&deploy).volume_mounts.as_ref().unwrap();
        let home_mount = mounts.iter().find(|m| m.name == "home").unwrap();
        assert_eq!(home_mount.mount_path, "/home/dev");
    }

    #[test]
    fn deployment_env_carries_owner_and_mode() {
        let deploy = build_deployment(&testutil::standalone("demo"), &flavor());
        let env = container_of_deployment(&deploy).env.as_ref().unwrap();
        let get = |k: &str| {
            env.iter()
                .find(|e| e.name == k)
                .and_then(|e| e.value.as_deref())
        };
        assert_eq!(get("DEVSERVER_OWNER"), Some("alice@example.com"));
        assert_eq!(get("DEVSERVER_MODE"), Some("standalone"));
    }

    #[test]
    fn shared_claim_is_mounted_at_shared() {
        let mut ds = testutil::standalone("demo");
        ds.spec.shared_volume_claim_name = Some("team-efs".to_string());

        let deploy = build_deployment(&ds, &flavor());
        let pod = deploy.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        let shared = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "shared")
            .unwrap();
        assert_eq!(
            shared.persistent_volume_claim.as_ref().unwrap().claim_name,
            "team-efs"
        );

        let mounts = container_of_deployment(&deploy).volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/shared"));
    }

    #[test]
    fn ssh_disabled_drops_ssh_plumbing() {
        let mut ds = testutil::standalone("demo");
        ds.spec.enable_ssh = false;

        let deploy = build_deployment(&ds, &flavor());
        let container = container_of_deployment(&deploy);
        assert!(container.ports.is_none());

        let mounts = container.volume_mounts.as_ref().unwrap();
        assert!(!mounts.iter().any(|m| m.name == "host-keys"));
        assert!(!mounts.iter().any(|m| m.name == "sshd-config"));
    }

    #[test]
    fn statefulset_replicas_follow_world_size() {
        let sts = build_statefulset(&distributed(4), &flavor());
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(4));
        assert_eq!(spec.service_name.as_deref(), Some("train-peers"));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("OrderedReady"));
    }

    #[test]
    fn statefulset_provides_home_via_claim_template() {
        let sts = build_statefulset(&distributed(2), &flavor());
        let spec = sts.spec.as_ref().unwrap();

        let templates = spec.volume_claim_templates.as_ref().unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].metadata.name.as_deref(), Some("home"));

        // No pod-level home volume: each replica gets its own claim.
        let pod = spec.template.spec.as_ref().unwrap();
        let has_home_volume = pod
            .volumes
            .as_ref()
            .map(|v| v.iter().any(|vol| vol.name == "home"))
            .unwrap_or(false);
        assert!(!has_home_volume);
    }

    #[test]
    fn statefulset_env_carries_the_rendezvous_contract() {
        let sts = build_statefulset(&distributed(4), &flavor());
        let container = &sts
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0];
        let env = container.env.as_ref().unwrap();
        let get = |k: &str| env.iter().find(|e| e.name == k);

        assert_eq!(get("WORLD_SIZE").unwrap().value.as_deref(), Some("4"));
        assert_eq!(
            get("MASTER_ADDR").unwrap().value.as_deref(),
            Some("train-0.train-peers.dev-alice.svc")
        );
        assert_eq!(get("MASTER_PORT").unwrap().value.as_deref(), Some("29500"));
        assert_eq!(get("NCCL_DEBUG").unwrap().value.as_deref(), Some("INFO"));

        let rank = get("RANK").unwrap();
        let field_path = rank
            .value_from
            .as_ref()
            .unwrap()
            .field_ref
            .as_ref()
            .unwrap()
            .field_path
            .clone();
        assert!(field_path.contains("pod-index"));
    }

    #[test]
    fn empty_nccl_settings_add_no_env() {
        let ds = testutil::devserver(
            "train",
            serde_json::json!({
                "owner": "bob@example.com",
                "flavor": "gpu-large",
                "mode": "distributed",
                "distributed": {"worldSize": 2},
            }),
        );
        let sts = build_statefulset(&ds, &flavor());
        let env = sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap()
            .clone();
        let expected = ["DEVSERVER_OWNER", "DEVSERVER_MODE", "RANK", "WORLD_SIZE", "MASTER_ADDR", "MASTER_PORT"];
        assert_eq!(env.len(), expected.len());
    }

    #[test]
    fn builders_are_deterministic() {
        let ds = distributed(3);
        let f = flavor();
        assert_eq!(
            serde_json::to_value(build_statefulset(&ds, &f)).unwrap(),
            serde_json::to_value(build_statefulset(&ds, &f)).unwrap()
        );
    }
}
