//! Function Deployment

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

use super::{
    function_target_port, restrictive_container_security_context, with_pod_security_context,
    FUNCTION_PORT,
};
use crate::config::FunctionConfig;
use crate::runtime::runtime_config;
use crate::snapshot::SystemState;

/// Name of the function container
pub const FUNCTION_CONTAINER_NAME: &str = "function";

const FUNCTION_USER: i64 = 10001;
const SECRET_VOLUME_MODE: i32 = 0o666;
const HEALTH_PATH: &str = "/healthz";

/// Expected Deployment for the snapshot
pub fn build_deployment(state: &SystemState, config: &FunctionConfig) -> Deployment {
    let spec = &state.function.spec;
    let resources = spec
        .resource_configuration
        .as_ref()
        .and_then(|r| r.function.clone())
        .unwrap_or_else(|| config.default_function_resources.clone());

    let mut volumes = vec![Volume {
        name: "tmp-dir".to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            size_limit: Some(Quantity("100Mi".to_string())),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "tmp-dir".to_string(),
        mount_path: "/tmp".to_string(),
        ..Default::default()
    }];
    for secret in &spec.secret_mounts {
        volumes.push(Volume {
            name: secret.secret_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.secret_name.clone()),
                default_mode: Some(SECRET_VOLUME_MODE),
                optional: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: secret.secret_name.clone(),
            mount_path: secret.mount_path.clone(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let container = Container {
        name: FUNCTION_CONTAINER_NAME.to_string(),
        image: Some(state.image_address(&state.docker.pull_address)),
        env: Some(function_env(state, config)),
        resources: Some(resources),
        volume_mounts: Some(mounts),
        image_pull_policy: Some("IfNotPresent".to_string()),
        startup_probe: Some(Probe {
            period_seconds: Some(5),
            success_threshold: Some(1),
            failure_threshold: Some(30),
            ..health_probe()
        }),
        readiness_probe: Some(Probe {
            failure_threshold: Some(1),
            period_seconds: Some(5),
            timeout_seconds: Some(2),
            ..health_probe()
        }),
        liveness_probe: Some(Probe {
            failure_threshold: Some(3),
            period_seconds: Some(5),
            timeout_seconds: Some(4),
            ..health_probe()
        }),
        security_context: Some(restrictive_container_security_context()),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        volumes: Some(volumes),
        service_account_name: Some(config.image_pull_service_account.clone()),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", state.name)),
            namespace: Some(state.namespace.clone()),
            labels: Some(state.function_labels()),
            owner_references: state.owner_reference().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.expected_replicas()),
            selector: LabelSelector {
                match_labels: Some(state.deployment_selector_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(state.pod_labels()),
                    annotations: Some(state.pod_annotations()),
                    ..Default::default()
                }),
                spec: Some(with_pod_security_context(pod_spec, FUNCTION_USER)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: function_target_port(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn function_env(state: &SystemState, config: &FunctionConfig) -> Vec<EnvVar> {
    let plain = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };
    let mut env = state.function.spec.env.clone();
    env.extend(runtime_config(state.function.spec.runtime).envs);
    env.extend([
        plain("SERVICE_NAMESPACE", &state.namespace),
        plain("TRACE_COLLECTOR_ENDPOINT", &config.trace_collector_endpoint),
        plain("PUBLISHER_PROXY_ADDRESS", &config.publisher_proxy_address),
        plain("FUNC_HANDLER", "main"),
        plain("MOD_NAME", "handler"),
        plain("FUNC_PORT", &FUNCTION_PORT.to_string()),
    ]);
    env
}

/// Function container of a Deployment
pub fn function_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.first())
}

/// Template annotations of a Deployment, empty when unset
pub fn template_annotations(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resources;
    use crate::snapshot::tests::{inline_function, state};
    use serverless_common::crd::{ResourceConfiguration, ScaleConfig, SecretMount};
    use serverless_common::labels::FUNCTION_RESOURCE_LABEL;

    fn env_value<'a>(deployment: &'a Deployment, name: &str) -> Option<&'a str> {
        function_container(deployment)
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|e| e.name == name))
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn image_comes_from_pull_address() {
        let s = state(inline_function("hello"));
        let deployment = build_deployment(&s, &FunctionConfig::default());
        let image = function_container(&deployment).unwrap().image.clone().unwrap();
        assert_eq!(
            image,
            format!("localhost:32137/default-hello:{}", s.image_tag())
        );
        assert_eq!(deployment.metadata.generate_name.as_deref(), Some("hello-"));
    }

    #[test]
    fn selector_is_a_subset_of_pod_labels() {
        let mut function = inline_function("hello");
        function.spec.labels = Some(BTreeMap::from([("app".to_string(), "x".to_string())]));
        let deployment = build_deployment(&state(function), &FunctionConfig::default());
        let spec = deployment.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(selector[FUNCTION_RESOURCE_LABEL], "deployment");
        for (k, v) in &selector {
            assert_eq!(pod_labels.get(k), Some(v));
        }
        assert_eq!(pod_labels["app"], "x");
    }

    #[test]
    fn runtime_and_platform_env_follow_user_env() {
        let mut function = inline_function("hello");
        function.spec.env = vec![EnvVar {
            name: "GREETING".to_string(),
            value: Some("hi".to_string()),
            ..Default::default()
        }];
        let deployment = build_deployment(&state(function), &FunctionConfig::default());
        let env = function_container(&deployment).unwrap().env.clone().unwrap();
        assert_eq!(env[0].name, "GREETING");
        assert_eq!(env_value(&deployment, "FUNC_RUNTIME"), Some("nodejs18"));
        assert_eq!(env_value(&deployment, "SERVICE_NAMESPACE"), Some("default"));
        assert_eq!(env_value(&deployment, "FUNC_PORT"), Some("8080"));
    }

    #[test]
    fn replicas_default_to_min_bound() {
        let mut function = inline_function("hello");
        function.spec.scale_config = Some(ScaleConfig {
            min_replicas: Some(2),
            max_replicas: Some(5),
        });
        let deployment = build_deployment(&state(function), &FunctionConfig::default());
        assert_eq!(deployment.spec.unwrap().replicas, Some(2));
    }

    #[test]
    fn explicit_resources_win_over_defaults() {
        let mut function = inline_function("hello");
        function.spec.resource_configuration = Some(ResourceConfiguration {
            function: Some(resources("1", "1Gi", "2", "2Gi")),
            build: None,
        });
        let deployment = build_deployment(&state(function), &FunctionConfig::default());
        let r = function_container(&deployment).unwrap().resources.clone().unwrap();
        assert_eq!(r.limits.unwrap()["memory"], Quantity("2Gi".to_string()));
    }

    #[test]
    fn secret_mounts_are_read_only_volumes() {
        let mut function = inline_function("hello");
        function.spec.secret_mounts = vec![SecretMount {
            secret_name: "db-creds".to_string(),
            mount_path: "/secrets/db".to_string(),
        }];
        let deployment = build_deployment(&state(function), &FunctionConfig::default());
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volume = pod
            .volumes
            .unwrap()
            .into_iter()
            .find(|v| v.name == "db-creds")
            .unwrap();
        assert_eq!(volume.secret.unwrap().default_mode, Some(0o666));
        let mount = pod.containers[0]
            .volume_mounts
            .clone()
            .unwrap()
            .into_iter()
            .find(|m| m.name == "db-creds")
            .unwrap();
        assert_eq!(mount.read_only, Some(true));
        assert_eq!(pod.security_context.unwrap().run_as_user, Some(10001));
    }

    #[test]
    fn probes_hit_health_endpoint() {
        let deployment =
            build_deployment(&state(inline_function("hello")), &FunctionConfig::default());
        let container = function_container(&deployment).unwrap();
        let startup = container.startup_probe.as_ref().unwrap();
        assert_eq!(startup.failure_threshold, Some(30));
        assert_eq!(
            startup.http_get.as_ref().unwrap().path.as_deref(),
            Some("/healthz")
        );
        assert_eq!(
            container.liveness_probe.as_ref().unwrap().timeout_seconds,
            Some(4)
        );
    }
}
