//! Home-directory volume claim builder.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{devserver_labels, home_pvc_name, owner_references};
use crate::crd::DevServer;

/// Build the `<name>-home` claim backing `/home/dev`.
///
/// The claim spec is immutable once created: reconciliation only ever
/// re-applies metadata, never this spec.
pub fn build_home_pvc(ds: &DevServer) -> PersistentVolumeClaim {
    let name = ds.name_any();

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(home_pvc_name(ds)),
            namespace: ds.namespace(),
            labels: Some(devserver_labels(&name)),
            owner_references: Some(owner_references(ds)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(ds.spec.persistent_home_size.clone()),
                )])),
                ..Default::default()
            }),
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
    fn pvc_requests_the_spec_size() {
        let mut ds = testutil::standalone("demo");
        ds.spec.persistent_home_size = "50Gi".to_string();

        let pvc = build_home_pvc(&ds);
        assert_eq!(pvc.metadata.name.as_deref(), Some("demo-home"));
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("dev-alice"));

        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "50Gi");
    }

    #[test]
    fn pvc_defaults_to_100gi() {
        let pvc = build_home_pvc(&testutil::standalone("demo"));
        let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "100Gi");
    }

    #[test]
    fn pvc_is_owned_by_the_devserver() {
        let pvc = build_home_pvc(&testutil::standalone("demo"));
        let owners = pvc.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "DevServer");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn builder_is_deterministic() {
        let ds = testutil::standalone("demo");
        assert_eq!(
            serde_json::to_value(build_home_pvc(&ds)).unwrap(),
            serde_json::to_value(build_home_pvc(&ds)).unwrap()
        );
    }
}
