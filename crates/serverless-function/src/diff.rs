//! Equality predicates between observed and expected objects
//!
//! Each predicate compares only the fields the controller sets. Fields the
//! API server defaults or other controllers own are ignored, otherwise every
//! pass would see drift and write.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, ResourceRequirements, Service, ServicePort, Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube_quantity::ParsedQuantity;

use crate::resources::deployment::{function_container, template_annotations};
use crate::resources::job::destination_arg;
use crate::resources::service::SERVICE_TYPE;

/// Map equality treating `None` as empty
pub fn maps_equal(
    a: Option<&BTreeMap<String, String>>,
    b: Option<&BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    a.unwrap_or(&empty) == b.unwrap_or(&empty)
}

/// Jobs build the same image
pub fn equal_jobs(existing: &Job, expected: &Job) -> bool {
    destination_arg(existing) == destination_arg(expected)
}

/// Job labels match the expected set
pub fn job_labels_equal(existing: &Job, expected: &Job) -> bool {
    maps_equal(
        existing.metadata.labels.as_ref(),
        expected.metadata.labels.as_ref(),
    )
}

/// Env lists match by name, value and source, in order
pub fn envs_equal(existing: &[EnvVar], expected: &[EnvVar]) -> bool {
    existing.len() == expected.len()
        && existing.iter().zip(expected).all(|(a, b)| {
            a.name == b.name
                && a.value.as_deref().unwrap_or_default() == b.value.as_deref().unwrap_or_default()
                && a.value_from == b.value_from
        })
}

/// Requests and limits hold the same amounts
///
/// `500m` and `0.5` are the same cpu amount, `1Gi` and `1024Mi` the same
/// memory amount.
pub fn equal_resources(existing: &ResourceRequirements, expected: &ResourceRequirements) -> bool {
    quantity_maps_equal(existing.requests.as_ref(), expected.requests.as_ref())
        && quantity_maps_equal(existing.limits.as_ref(), expected.limits.as_ref())
}

fn quantity_maps_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len()
        && a.iter()
            .all(|(k, qa)| b.get(k).is_some_and(|qb| quantities_equal(qa, qb)))
}

/// Quantities are equal when they hold the same amount
///
/// The API server rounds values finer than one nano-unit up, so amounts less
/// than `1n` apart are treated as equal. Unparsable values compare as text.
fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    let parse = |q: &Quantity| ParsedQuantity::try_from(q.0.clone()).ok();
    match (parse(a), parse(b), parse(&Quantity("1n".to_string()))) {
        (Some(x), Some(y), Some(nano)) => {
            if x == y {
                return true;
            }
            let difference = if x > y { x - y } else { y - x };
            difference < nano
        }
        _ => a.0 == b.0,
    }
}

fn secret_volumes(deployment: &Deployment) -> Vec<&Volume> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.volumes.as_ref())
        .map(|vs| vs.iter().filter(|v| v.secret.is_some()).collect())
        .unwrap_or_default()
}

fn secret_volumes_equal(existing: &Deployment, expected: &Deployment) -> bool {
    let (a, b) = (secret_volumes(existing), secret_volumes(expected));
    a.len() == b.len()
        && a.iter().zip(&b).all(|(x, y)| {
            x.name == y.name
                && x.secret.as_ref().map(|s| &s.secret_name)
                    == y.secret.as_ref().map(|s| &s.secret_name)
        })
}

fn mounts_equal(existing: &Container, expected: &Container) -> bool {
    let a = existing.volume_mounts.as_deref().unwrap_or_default();
    let b = expected.volume_mounts.as_deref().unwrap_or_default();
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.name == y.name
                && x.mount_path == y.mount_path
                && x.sub_path == y.sub_path
                && x.read_only.unwrap_or(false) == y.read_only.unwrap_or(false)
        })
}

fn container_count(deployment: &Deployment) -> usize {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|s| s.containers.len())
        .unwrap_or(0)
}

fn template_labels(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
}

/// Deployments run the same workload
///
/// Replica counts are compared only when `scaling_enabled` is false; with
/// autoscaling the HPA owns them.
pub fn equal_deployments(existing: &Deployment, expected: &Deployment, scaling_enabled: bool) -> bool {
    if container_count(existing) != 1 || container_count(expected) != 1 {
        return false;
    }
    let (Some(have), Some(want)) = (function_container(existing), function_container(expected))
    else {
        return false;
    };

    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    let default_resources = ResourceRequirements::default();

    have.image == want.image
        && envs_equal(
            have.env.as_deref().unwrap_or_default(),
            want.env.as_deref().unwrap_or_default(),
        )
        && maps_equal(
            existing.metadata.labels.as_ref(),
            expected.metadata.labels.as_ref(),
        )
        && maps_equal(template_labels(existing), template_labels(expected))
        && equal_resources(
            have.resources.as_ref().unwrap_or(&default_resources),
            want.resources.as_ref().unwrap_or(&default_resources),
        )
        && (scaling_enabled || replicas(existing) == replicas(expected))
        && secret_volumes_equal(existing, expected)
        && mounts_equal(have, want)
        && template_annotations(existing) == template_annotations(expected)
}

fn ports_equal(existing: &[ServicePort], expected: &[ServicePort]) -> bool {
    existing.len() == expected.len()
        && existing.iter().zip(expected).all(|(a, b)| {
            a.name == b.name
                && a.port == b.port
                && a.target_port == b.target_port
                && a.protocol.as_deref().unwrap_or("TCP") == b.protocol.as_deref().unwrap_or("TCP")
        })
}

/// Services have the same type, route the same way and carry the same labels
pub fn equal_services(existing: &Service, expected: &Service) -> bool {
    let selector = |s: &Service| s.spec.as_ref().and_then(|sp| sp.selector.clone());
    let ports = |s: &Service| {
        s.spec
            .as_ref()
            .and_then(|sp| sp.ports.clone())
            .unwrap_or_default()
    };
    let type_ = |s: &Service| {
        s.spec
            .as_ref()
            .and_then(|sp| sp.type_.clone())
            .unwrap_or_else(|| SERVICE_TYPE.to_string())
    };
    type_(existing) == type_(expected)
        && maps_equal(selector(existing).as_ref(), selector(expected).as_ref())
        && maps_equal(
            existing.metadata.labels.as_ref(),
            expected.metadata.labels.as_ref(),
        )
        && ports_equal(&ports(existing), &ports(expected))
}

/// Autoscalers target the same Deployment with the same bounds
pub fn equal_hpas(existing: &HorizontalPodAutoscaler, expected: &HorizontalPodAutoscaler) -> bool {
    let (Some(a), Some(b)) = (existing.spec.as_ref(), expected.spec.as_ref()) else {
        return false;
    };
    a.target_cpu_utilization_percentage == b.target_cpu_utilization_percentage
        && a.min_replicas == b.min_replicas
        && a.max_replicas == b.max_replicas
        && a.scale_target_ref.name == b.scale_target_ref.name
        && maps_equal(
            existing.metadata.labels.as_ref(),
            expected.metadata.labels.as_ref(),
        )
}
