//! Image build Job
//!
//! Inline builds mount the sources ConfigMap into the workspace. Git builds
//! clone into an emptyDir workspace from an init container first.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath,
    PodSpec, PodTemplateSpec, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::ObjectMeta;

use serverless_common::crd::{RepositoryAuthType, SourceType};
use serverless_common::Error;

use super::{build_container_security_context, restrictive_container_security_context,
    with_pod_security_context, WORKSPACE_MOUNT_PATH};
use crate::config::FunctionConfig;
use crate::resources::configmap::{FUNCTION_DEPS_KEY, FUNCTION_SOURCE_KEY};
use crate::runtime::{runtime_config, RuntimeConfig};
use crate::snapshot::SystemState;

/// Executor argument carrying the push destination
pub const DESTINATION_ARG: &str = "--destination";

const ROOT_USER: i64 = 0;
const SIDECAR_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";

/// Expected build Job for the snapshot
///
/// Inline builds need the single sources ConfigMap to exist.
pub fn build_job(state: &SystemState, config: &FunctionConfig) -> Result<Job, Error> {
    let rtm = runtime_config(state.function.spec.runtime);
    let pod_spec = match state.function.spec.source_type() {
        SourceType::Inline => {
            let [cm] = state.config_maps.as_slice() else {
                return Err(Error::internal_with_context(
                    "build",
                    format!(
                        "expected one sources ConfigMap, found {}",
                        state.config_maps.len()
                    ),
                ));
            };
            inline_pod_spec(state, config, &rtm, &cm.metadata.name.clone().unwrap_or_default())
        }
        SourceType::Git => git_pod_spec(state, config, &rtm),
    };

    let labels = state.function_labels();
    Ok(Job {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-build-", state.name)),
            namespace: Some(state.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: state.owner_reference().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(1),
            completions: Some(1),
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        SIDECAR_INJECT_ANNOTATION.to_string(),
                        "false".to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(with_pod_security_context(pod_spec, ROOT_USER)),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn inline_pod_spec(
    state: &SystemState,
    config: &FunctionConfig,
    rtm: &RuntimeConfig,
    config_map: &str,
) -> PodSpec {
    let src = format!("{WORKSPACE_MOUNT_PATH}/src");
    let mut mounts = vec![
        read_only_mount(
            "sources",
            &format!("{src}/{}", rtm.dependency_file),
            Some(FUNCTION_DEPS_KEY),
        ),
        read_only_mount(
            "sources",
            &format!("{src}/{}", rtm.function_file),
            Some(FUNCTION_SOURCE_KEY),
        ),
        dockerfile_mount(),
        read_only_mount("credentials", "/docker", None),
    ];
    mounts.push(package_config_mount(rtm));

    PodSpec {
        volumes: Some(vec![
            credentials_volume(state),
            registry_config_volume(config),
            runtime_volume(rtm),
            Volume {
                name: "sources".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        containers: vec![executor_container(state, config, mounts)],
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    }
}

fn git_pod_spec(state: &SystemState, config: &FunctionConfig, rtm: &RuntimeConfig) -> PodSpec {
    let base_dir = state
        .function
        .spec
        .source
        .git_repository
        .as_ref()
        .map(|g| g.base_dir.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let mounts = vec![
        read_only_mount("credentials", "/docker", None),
        VolumeMount {
            name: "workspace".to_string(),
            mount_path: format!("{WORKSPACE_MOUNT_PATH}/src"),
            sub_path: Some(base_dir),
            ..Default::default()
        },
        dockerfile_mount(),
        package_config_mount(rtm),
    ];

    PodSpec {
        volumes: Some(vec![
            credentials_volume(state),
            registry_config_volume(config),
            runtime_volume(rtm),
            Volume {
                name: "workspace".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ]),
        init_containers: Some(vec![repo_fetcher_container(state, config)]),
        containers: vec![executor_container(state, config, mounts)],
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    }
}

fn executor_container(
    state: &SystemState,
    config: &FunctionConfig,
    volume_mounts: Vec<VolumeMount>,
) -> Container {
    let mut args = config.build.executor_args.clone();
    args.push(format!(
        "{DESTINATION_ARG}={}",
        state.image_address(&state.docker.push_address)
    ));
    args.push(format!("--context=dir://{WORKSPACE_MOUNT_PATH}"));
    if let Some(base_image) = state
        .function
        .spec
        .runtime_image_override
        .as_deref()
        .filter(|i| !i.is_empty())
    {
        args.push(format!("--build-arg=base_image={base_image}"));
    }

    let resources = state
        .function
        .spec
        .resource_configuration
        .as_ref()
        .and_then(|r| r.build.clone())
        .unwrap_or_else(|| config.build.default_resources.clone());

    Container {
        name: "executor".to_string(),
        image: Some(config.build.executor_image.clone()),
        args: Some(args),
        resources: Some(resources),
        volume_mounts: Some(volume_mounts),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![EnvVar {
            name: "DOCKER_CONFIG".to_string(),
            value: Some("/docker/.docker/".to_string()),
            ..Default::default()
        }]),
        security_context: Some(build_container_security_context()),
        ..Default::default()
    }
}

fn repo_fetcher_container(state: &SystemState, config: &FunctionConfig) -> Container {
    Container {
        name: "repo-fetcher".to_string(),
        image: Some(config.build.repo_fetcher_image.clone()),
        env: Some(repo_fetcher_env(state)),
        image_pull_policy: Some("Always".to_string()),
        volume_mounts: Some(vec![VolumeMount {
            name: "workspace".to_string(),
            mount_path: WORKSPACE_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        security_context: Some(restrictive_container_security_context()),
        ..Default::default()
    }
}

fn repo_fetcher_env(state: &SystemState) -> Vec<EnvVar> {
    let plain = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };
    let from_secret = |name: &str, secret: &str, key: &str, optional: bool| EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: optional.then_some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let Some(git) = state.function.spec.source.git_repository.as_ref() else {
        return Vec::new();
    };
    let mut env = vec![
        plain("APP_MOUNT_PATH", WORKSPACE_MOUNT_PATH),
        plain("APP_REPOSITORY_URL", &git.url),
        plain(
            "APP_REPOSITORY_COMMIT",
            state.status.commit.as_deref().unwrap_or_default(),
        ),
    ];

    if let Some(auth) = &git.auth {
        env.push(plain("APP_REPOSITORY_AUTH_TYPE", &auth.type_.to_string()));
        match auth.type_ {
            RepositoryAuthType::Basic => {
                env.push(from_secret(
                    "APP_REPOSITORY_USERNAME",
                    &auth.secret_name,
                    "username",
                    false,
                ));
                env.push(from_secret(
                    "APP_REPOSITORY_PASSWORD",
                    &auth.secret_name,
                    "password",
                    false,
                ));
            }
            RepositoryAuthType::Key => {
                env.push(from_secret(
                    "APP_REPOSITORY_KEY",
                    &auth.secret_name,
                    "key",
                    false,
                ));
                env.push(from_secret(
                    "APP_REPOSITORY_PASSWORD",
                    &auth.secret_name,
                    "password",
                    true,
                ));
            }
        }
    }
    env
}

fn read_only_mount(name: &str, path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        read_only: Some(true),
        ..Default::default()
    }
}

// Files are mounted with subPath: COPY in the Dockerfile does not follow the
// symlinks a plain ConfigMap mount creates.
fn dockerfile_mount() -> VolumeMount {
    read_only_mount(
        "runtime",
        &format!("{WORKSPACE_MOUNT_PATH}/Dockerfile"),
        Some("Dockerfile"),
    )
}

fn package_config_mount(rtm: &RuntimeConfig) -> VolumeMount {
    read_only_mount(
        "registry-config",
        &format!(
            "{WORKSPACE_MOUNT_PATH}/registry-config/{}",
            rtm.package_config_file
        ),
        Some(rtm.package_config_file),
    )
}

fn credentials_volume(state: &SystemState) -> Volume {
    Volume {
        name: "credentials".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(state.docker.active_secret.clone()),
            items: Some(vec![KeyToPath {
                key: ".dockerconfigjson".to_string(),
                path: ".docker/config.json".to_string(),
                mode: None,
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn registry_config_volume(config: &FunctionConfig) -> Volume {
    Volume {
        name: "registry-config".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(config.package_registry_secret.clone()),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn runtime_volume(rtm: &RuntimeConfig) -> Volume {
    Volume {
        name: "runtime".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: rtm.dockerfile_config_map.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Executor `--destination=...` argument of a Job, if any
pub fn destination_arg(job: &Job) -> Option<&str> {
    job.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.first())
        .and_then(|c| c.args.as_ref())
        .and_then(|args| args.iter().find(|a| a.starts_with(DESTINATION_ARG)))
        .map(String::as_str)
}

/// Job reports a true `Failed` condition whose reason satisfies `reason`
pub fn job_failed(job: &Job, reason: impl Fn(&str) -> bool) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
        .is_some_and(|c| reason(c.reason.as_deref().unwrap_or_default()))
}

/// Job has a succeeded Pod and the Job controller marked it complete
pub fn job_succeeded(job: &Job) -> bool {
    job.status.as_ref().is_some_and(|s| {
        s.succeeded.is_some_and(|n| n > 0) && s.completion_time.is_some()
    })
}

/// Message of the `Failed` condition, if the Job failed
pub fn job_failure_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
        .and_then(|c| c.message.clone())
}
