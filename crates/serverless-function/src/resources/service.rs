//! Function Service

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::ObjectMeta;

use super::{function_target_port, SERVICE_PORT};
use crate::snapshot::SystemState;

/// Function Services are only reachable inside the cluster
pub const SERVICE_TYPE: &str = "ClusterIP";

/// Expected Service for the snapshot; named after the Function
pub fn build_service(state: &SystemState) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(state.name.clone()),
            namespace: Some(state.namespace.clone()),
            labels: Some(state.function_labels()),
            annotations: Some(BTreeMap::from([
                ("prometheus.io/port".to_string(), SERVICE_PORT.to_string()),
                ("prometheus.io/path".to_string(), "/metrics".to_string()),
                ("prometheus.io/scrape".to_string(), "true".to_string()),
            ])),
            owner_references: state.owner_reference().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(SERVICE_TYPE.to_string()),
            ports: Some(service_ports()),
            selector: Some(state.deployment_selector_labels()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn service_ports() -> Vec<ServicePort> {
    vec![ServicePort {
        name: Some("http".to_string()),
        port: SERVICE_PORT,
        target_port: Some(function_target_port()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]
}
