//! Image registry resolution
//!
//! The registry is configured per namespace through one of two Secrets. A
//! user-provided external Secret wins over the default one installed with the
//! controller.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use serverless_common::Error;

use crate::client::KubeClient;
use crate::config::FunctionConfig;

/// Registry addresses and the Secret mounted into build Pods
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DockerConfig {
    /// Secret with `.dockerconfigjson` mounted as build credentials
    pub active_secret: String,
    /// Registry the build pushes to
    pub push_address: String,
    /// Registry the function Deployment pulls from
    pub pull_address: String,
}

/// Secret data decoded as UTF-8 strings (invalid sequences are replaced)
pub fn secret_strings(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect()
}

/// Resolve the registry configuration for `namespace`
pub async fn resolve_docker_config(
    client: &dyn KubeClient,
    namespace: &str,
    config: &FunctionConfig,
) -> Result<DockerConfig, Error> {
    if let Some(secret) = client
        .get_secret(namespace, &config.external_registry_secret)
        .await?
    {
        let data = secret_strings(&secret);
        let address = data.get("registryAddress").cloned().unwrap_or_default();
        debug!(namespace, secret = %config.external_registry_secret, "using external registry");
        return Ok(DockerConfig {
            active_secret: config.external_registry_secret.clone(),
            push_address: address.clone(),
            pull_address: address,
        });
    }

    if let Some(secret) = client
        .get_secret(namespace, &config.default_registry_secret)
        .await?
    {
        let data = secret_strings(&secret);
        let push = data.get("registryAddress").cloned().unwrap_or_default();
        let pull = if data.get("isInternal").map(String::as_str) == Some("true") {
            data.get("serverAddress").cloned().unwrap_or_default()
        } else {
            push.clone()
        };
        return Ok(DockerConfig {
            active_secret: config.default_registry_secret.clone(),
            push_address: push,
            pull_address: pull,
        });
    }

    Err(Error::registry_config(
        namespace,
        format!(
            "none of the registry secrets ({}, {}) found in function namespace",
            config.default_registry_secret, config.external_registry_secret
        ),
    ))
}
