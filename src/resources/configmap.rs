//! ConfigMap builder: sshd configuration and peer-discovery hints.

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{configmap_name, devserver_labels, owner_references, peers_service_name};
use crate::crd::{DevServer, DevServerMode};

/// TCP port peers rendezvous on in distributed mode.
pub const MASTER_PORT: i32 = 29500;

const SSHD_CONFIG: &str = "\
# Managed by the devserver operator.

Port 22
PermitRootLogin no
PasswordAuthentication no
ChallengeResponseAuthentication no
PrintMotd no
Subsystem sftp internal-sftp
AuthorizedKeysFile /home/dev/.ssh/authorized_keys
HostKey /etc/ssh/hostkeys/ssh_host_ed25519_key
AllowAgentForwarding yes
";

/// Build the `<name>-config` map.
///
/// Always carries the sshd configuration when SSH is enabled; in
/// distributed mode it additionally carries rendezvous hints so a pod can
/// discover its peers without querying the API. Returns `None` when the
/// map would be empty (standalone with SSH disabled).
pub fn build_configmap(ds: &DevServer) -> Option<ConfigMap> {
    let name = ds.name_any();
    let namespace = ds.namespace().unwrap_or_default();
    let mut data = BTreeMap::new();

    if ds.spec.enable_ssh {
        data.insert("sshd_config".to_string(), SSHD_CONFIG.to_string());
    }

    if ds.spec.mode == DevServerMode::Distributed {
        let world_size = ds.world_size().max(1);
        let peers_svc = peers_service_name(ds);
        let peers: Vec<String> = (0..world_size)
            .map(|ordinal| format!("{name}-{ordinal}.{peers_svc}.{namespace}.svc"))
            .collect();

        data.insert("MASTER_ADDR".to_string(), peers[0].clone());
        data.insert("MASTER_PORT".to_string(), MASTER_PORT.to_string());
        data.insert("WORLD_SIZE".to_string(), world_size.to_string());
        data.insert("peers".to_string(), peers.join("\n"));
    }

    if data.is_empty() {
        return None;
    }

    Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(configmap_name(ds)),
            namespace: ds.namespace(),
            labels: Some(devserver_labels(&name)),
            owner_references: Some(owner_references(ds)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}
