//! Builders for the cluster objects owned by a DevServer.
//!
//! Every builder is a pure function from the root object (plus flavor where
//! relevant) to a desired child. Builders are deterministic: equal inputs
//! produce structurally equal objects. Each child carries a controller
//! owner reference back to its root so that cascade deletion falls out of
//! the platform.

mod configmap;
mod hostkeys;
mod pvc;
mod service;
mod workload;

pub use configmap::build_configmap;
pub use hostkeys::{build_hostkeys_secret, generate_host_keys, HOST_KEY_NAME};
pub use pvc::build_home_pvc;
pub use service::{build_headless_service, build_ssh_service};
pub use workload::{build_deployment, build_statefulset};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::DevServer;

/// Selector labels shared by every child of a DevServer.
pub fn devserver_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "devserver".to_string()),
        ("devserver".to_string(), name.to_string()),
    ])
}

/// Controller owner reference for children of a DevServer.
///
/// Returns an empty list when the root has no uid yet (an object read from
/// the API always has one).
pub fn owner_references(ds: &DevServer) -> Vec<OwnerReference> {
    ds.controller_owner_ref(&()).into_iter().collect()
}

/// Name of the home-directory volume claim.
pub fn home_pvc_name(ds: &DevServer) -> String {
    format!("{}-home", ds.name_any())
}

/// Name of the SSH service.
pub fn ssh_service_name(ds: &DevServer) -> String {
    format!("{}-ssh", ds.name_any())
}

/// Name of the headless peer-discovery service (distributed mode).
pub fn peers_service_name(ds: &DevServer) -> String {
    format!("{}-peers", ds.name_any())
}

/// Name of the host-key secret.
pub fn hostkeys_secret_name(ds: &DevServer) -> String {
    format!("{}-hostkeys", ds.name_any())
}

/// Name of the config map.
pub fn configmap_name(ds: &DevServer) -> String {
    format!("{}-config", ds.name_any())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_identify_the_devserver() {
        let labels = devserver_labels("demo");
        assert_eq!(labels["app"], "devserver");
        assert_eq!(labels["devserver"], "demo");
    }

    #[test]
    fn child_names_are_stable() {
        let ds = testutil::standalone("demo");
        assert_eq!(home_pvc_name(&ds), "demo-home");
        assert_eq!(ssh_service_name(&ds), "demo-ssh");
        assert_eq!(peers_service_name(&ds), "demo-peers");
        assert_eq!(hostkeys_secret_name(&ds), "demo-hostkeys");
        assert_eq!(configmap_name(&ds), "demo-config");
    }

    #[test]
    fn owner_reference_is_a_controller_edge() {
        let ds = testutil::standalone("demo");
        let refs = owner_references(&ds);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "DevServer");
        assert_eq!(refs[0].name, "demo");
        assert_eq!(refs[0].controller, Some(true));
    }
}
