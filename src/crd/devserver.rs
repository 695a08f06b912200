//! DevServer Custom Resource Definition.
//!
//! A DevServer is one ephemeral, SSH-accessible development environment.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Condition;

/// DevServer is the Schema for the devservers API.
///
/// The operator turns each DevServer into a workload (Deployment or
/// StatefulSet), a persistent home volume, SSH plumbing and, in
/// distributed mode, a headless peer-discovery service.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "devserver.io",
    version = "v1",
    kind = "DevServer",
    plural = "devservers",
    shortname = "dvs",
    namespaced,
    status = "DevServerStatus",
    printcolumn = r#"{"name":"Owner", "type":"string", "jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Flavor", "type":"string", "jsonPath":".spec.flavor"}"#,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevServerSpec {
    /// Identity of the human owner, e.g. an email address.
    pub owner: String,

    /// Name of the cluster-scoped DevServerFlavor providing the resource
    /// envelope for this server.
    pub flavor: String,

    /// Container image to run.
    #[serde(default = "default_image")]
    pub image: String,

    /// Server shape: one pod, or an ordered set of peers.
    #[serde(default)]
    pub mode: DevServerMode,

    /// Distributed-training configuration. Only meaningful when mode is
    /// `distributed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributed: Option<DistributedSpec>,

    /// Size of the persistent home volume (a Kubernetes quantity).
    #[serde(default = "default_home_size")]
    pub persistent_home_size: String,

    /// Name of a pre-existing ReadWriteMany claim to mount at `/shared`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_volume_claim_name: Option<String>,

    /// Expose the server over SSH.
    #[serde(default = "default_true", rename = "enableSSH")]
    pub enable_ssh: bool,

    /// SSH access configuration.
    #[serde(default)]
    pub ssh: SshSpec,

    /// Lifecycle management settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleSpec>,
}

fn default_image() -> String {
    "ghcr.io/devserver/devserver-base:latest".to_string()
}

fn default_home_size() -> String {
    "100Gi".to_string()
}

fn default_true() -> bool {
    true
}

/// Server shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DevServerMode {
    /// A single pod.
    #[default]
    Standalone,
    /// An ordered set of `worldSize` pods with peer discovery.
    Distributed,
}

/// Distributed-training configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistributedSpec {
    /// Total number of peers.
    pub world_size: i32,

    /// Processes launched per node.
    #[serde(default = "default_nprocs")]
    pub nprocs_per_node: i32,

    /// Collective communication backend.
    #[serde(default)]
    pub backend: DistributedBackend,

    /// Extra NCCL environment settings, injected verbatim into each pod.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nccl_settings: BTreeMap<String, String>,
}

fn default_nprocs() -> i32 {
    1
}

/// Collective backend for distributed mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistributedBackend {
    /// NVIDIA NCCL.
    #[default]
    Nccl,
    /// Gloo.
    Gloo,
    /// MPI.
    Mpi,
}

/// SSH access configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshSpec {
    /// Public key authorized to log in as the dev user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Lifecycle management settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSpec {
    /// Seconds of idleness before auto-shutdown would apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<i32>,

    /// Whether idle servers should shut down automatically.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_shutdown: Option<bool>,

    /// Absolute instant after which the server is deleted. Derived from
    /// `timeToLive` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<Time>,

    /// Human-readable lifetime, e.g. `"30m"`, `"2h30m"`, `"1d"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<String>,
}

/// DevServer status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevServerStatus {
    /// Current lifecycle phase.
    #[serde(default)]
    pub phase: DevServerPhase,

    /// True once every owned child reports ready.
    #[serde(default)]
    pub ready: bool,

    /// `host:port` SSH endpoint, set when SSH is enabled and the service
    /// exists.
    #[serde(skip_serializing_if = "Option::is_none", rename = "sshEndpoint")]
    pub ssh_endpoint: Option<String>,

    /// First time the server became ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    /// Last time the server was observed idle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_idle_time: Option<Time>,

    /// Name of the owned SSH service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Names of the pods backing this server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_names: Vec<String>,

    /// Conditions with unique type keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// DevServer lifecycle phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DevServerPhase {
    /// Children are being created or are not yet ready.
    #[default]
    Pending,
    /// All children ready.
    Running,
    /// Deletion in progress.
    Terminating,
    /// Permanent validation failure or missing precondition.
    Failed,
}

impl DevServer {
    /// Resolved distributed world size, defaulting to 1 outside
    /// distributed mode.
    pub fn world_size(&self) -> i32 {
        match self.spec.mode {
            DevServerMode::Distributed => self
                .spec
                .distributed
                .as_ref()
                .map(|d| d.world_size)
                .unwrap_or(1),
            DevServerMode::Standalone => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "owner": "alice@example.com",
            "flavor": "cpu-small",
        })
    }

    #[test]
    fn spec_defaults() {
        let spec: DevServerSpec = serde_json::from_value(minimal_json()).unwrap();
        assert_eq!(spec.mode, DevServerMode::Standalone);
        assert_eq!(spec.persistent_home_size, "100Gi");
        assert!(spec.enable_ssh);
        assert!(spec.image.contains("devserver-base"));
        assert!(spec.distributed.is_none());
        assert!(spec.lifecycle.is_none());
    }

    #[test]
    fn spec_field_names_are_camel_case() {
        let spec: DevServerSpec = serde_json::from_value(minimal_json()).unwrap();
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("persistentHomeSize").is_some());
        assert!(json.get("enableSSH").is_some());
        assert!(json.get("persistent_home_size").is_none());
    }

    #[test]
    fn distributed_spec_roundtrip() {
        let spec: DevServerSpec = serde_json::from_value(serde_json::json!({
            "owner": "bob@example.com",
            "flavor": "gpu-large",
            "mode": "distributed",
            "distributed": {
                "worldSize": 4,
                "backend": "nccl",
                "ncclSettings": {"NCCL_DEBUG": "INFO"},
            },
        }))
        .unwrap();

        assert_eq!(spec.mode, DevServerMode::Distributed);
        let dist = spec.distributed.unwrap();
        assert_eq!(dist.world_size, 4);
        assert_eq!(dist.nprocs_per_node, 1);
        assert_eq!(dist.backend, DistributedBackend::Nccl);
        assert_eq!(dist.nccl_settings["NCCL_DEBUG"], "INFO");
    }

    #[test]
    fn empty_nccl_settings_not_serialized() {
        let dist = DistributedSpec {
            world_size: 2,
            nprocs_per_node: 1,
            backend: DistributedBackend::Gloo,
            nccl_settings: BTreeMap::new(),
        };
        let json = serde_json::to_value(&dist).unwrap();
        assert!(json.get("ncclSettings").is_none());
    }

    #[test]
    fn lifecycle_ttl_parsing_fields() {
        let lifecycle: LifecycleSpec = serde_json::from_value(serde_json::json!({
            "timeToLive": "2h30m",
            "autoShutdown": true,
            "idleTimeout": 3600,
        }))
        .unwrap();
        assert_eq!(lifecycle.time_to_live.as_deref(), Some("2h30m"));
        assert_eq!(lifecycle.idle_timeout, Some(3600));
        assert!(lifecycle.expiration_time.is_none());
    }

    #[test]
    fn world_size_defaults_to_one_for_standalone() {
        let ds = DevServer::new(
            "demo",
            serde_json::from_value(minimal_json()).unwrap(),
        );
        assert_eq!(ds.world_size(), 1);
    }

    #[test]
    fn unknown_fields_are_accepted() {
        let spec: Result<DevServerSpec, _> = serde_json::from_value(serde_json::json!({
            "owner": "alice@example.com",
            "flavor": "cpu-small",
            "futureField": {"nested": true},
        }));
        assert!(spec.is_ok());
    }
}
