//! Expected objects derived from a snapshot and the controller config
//!
//! Builders are pure: the same snapshot and config always produce the same
//! object, so the stages can rebuild and compare on every pass.

pub mod configmap;
pub mod deployment;
pub mod hpa;
pub mod job;
pub mod service;

use k8s_openapi::api::core::v1::{
    Capabilities, PodSecurityContext, PodSpec, SeccompProfile, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Port the function container listens on
pub const FUNCTION_PORT: i32 = 8080;

/// Service port exposed to callers
pub const SERVICE_PORT: i32 = 80;

/// Workspace root inside build Pods
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

pub(crate) fn function_target_port() -> IntOrString {
    IntOrString::Int(FUNCTION_PORT)
}

pub(crate) fn restrictive_container_security_context() -> SecurityContext {
    SecurityContext {
        privileged: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: None,
        }),
        proc_mount: Some("Default".to_string()),
        read_only_root_filesystem: Some(true),
        ..Default::default()
    }
}

pub(crate) fn build_container_security_context() -> SecurityContext {
    let mut ctx = restrictive_container_security_context();
    if let Some(caps) = ctx.capabilities.as_mut() {
        caps.add = Some(
            ["CHOWN", "FOWNER", "SETGID", "DAC_OVERRIDE"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        );
    }
    ctx.read_only_root_filesystem = Some(false);
    ctx
}

pub(crate) fn with_pod_security_context(mut spec: PodSpec, user: i64) -> PodSpec {
    spec.security_context = Some(PodSecurityContext {
        run_as_user: Some(user),
        run_as_group: Some(user),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    });
    spec.host_network = Some(false);
    spec.host_pid = Some(false);
    spec.host_ipc = Some(false);
    spec
}
