//! Service builders: SSH access and headless peer discovery.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{devserver_labels, owner_references, peers_service_name, ssh_service_name};
use crate::crd::DevServer;

fn ssh_port() -> ServicePort {
    ServicePort {
        name: Some("ssh".to_string()),
        port: 22,
        target_port: Some(IntOrString::Int(22)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Build the cluster-internal `<name>-ssh` service on TCP 22.
pub fn build_ssh_service(ds: &DevServer) -> Service {
    let name = ds.name_any();
    let labels = devserver_labels(&name);

    Service {
        metadata: ObjectMeta {
            name: Some(ssh_service_name(ds)),
            namespace: ds.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(owner_references(ds)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ssh_port()]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the `<name>-peers` headless service used for DNS-based peer
/// discovery in distributed mode.
pub fn build_headless_service(ds: &DevServer) -> Service {
    let name = ds.name_any();
    let labels = devserver_labels(&name);

    Service {
        metadata: ObjectMeta {
            name: Some(peers_service_name(ds)),
            namespace: ds.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(owner_references(ds)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(labels),
            ports: Some(vec![ssh_port()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;

    #[test]
    fn ssh_service_exposes_port_22() {
        let svc = build_ssh_service(&testutil::standalone("demo"));
        assert_eq!(svc.metadata.name.as_deref(), Some("demo-ssh"));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert!(spec.cluster_ip.is_none());

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
    }

    #[test]
    fn ssh_service_selects_devserver_pods() {
        let svc = build_ssh_service(&testutil::standalone("demo"));
        let selector = svc.spec.unwrap().selector.unwrap();
        assert_eq!(selector["app"], "devserver");
        assert_eq!(selector["devserver"], "demo");
    }

    #[test]
    fn headless_service_has_no_cluster_ip() {
        let svc = build_headless_service(&testutil::standalone("demo"));
        assert_eq!(svc.metadata.name.as_deref(), Some("demo-peers"));
        assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn services_carry_owner_references() {
        for svc in [
            build_ssh_service(&testutil::standalone("demo")),
            build_headless_service(&testutil::standalone("demo")),
        ] {
            let owners = svc.metadata.owner_references.unwrap();
            assert_eq!(owners[0].kind, "DevServer");
        }
    }
}
