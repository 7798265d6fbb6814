//! Function CRD types
//!
//! A `Function` describes source code (inline or from git), the runtime that
//! builds it, and the shape of the resulting workload. The controller turns
//! it into a ConfigMap, a build Job, a Deployment, a Service and optionally a
//! HorizontalPodAutoscaler.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{condition_status, Condition, ConditionStatus, ConditionType};
use crate::Error;

// =============================================================================
// Runtime
// =============================================================================

/// Language runtime used to build and run the function
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Runtime {
    /// Node.js 16
    #[serde(rename = "nodejs16")]
    NodeJs16,
    /// Node.js 18
    #[default]
    #[serde(rename = "nodejs18")]
    NodeJs18,
    /// Python 3.9
    #[serde(rename = "python39")]
    Python39,
}

impl Runtime {
    /// Returns true for the Node.js family
    pub fn is_nodejs(&self) -> bool {
        matches!(self, Self::NodeJs16 | Self::NodeJs18)
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeJs16 => write!(f, "nodejs16"),
            Self::NodeJs18 => write!(f, "nodejs18"),
            Self::Python39 => write!(f, "python39"),
        }
    }
}

// =============================================================================
// Source
// =============================================================================

/// Inline source code with its dependency manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineSource {
    /// Function handler source
    pub source: String,

    /// Dependency manifest (package.json, requirements.txt)
    #[serde(default)]
    pub dependencies: String,
}

/// Authentication method for a git repository
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryAuthType {
    /// Username and password (or token)
    Basic,
    /// SSH private key
    Key,
}

impl std::fmt::Display for RepositoryAuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Key => write!(f, "key"),
        }
    }
}

/// Reference to the Secret holding git credentials
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryAuth {
    /// Authentication method
    #[serde(rename = "type")]
    pub type_: RepositoryAuthType,

    /// Secret in the Function namespace with the credentials
    pub secret_name: String,
}

/// Git repository source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySource {
    /// Repository URL
    pub url: String,

    /// Branch, tag or commit to build
    #[serde(default)]
    pub reference: String,

    /// Directory inside the repository holding the function sources
    #[serde(default)]
    pub base_dir: String,

    /// Optional credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RepositoryAuth>,
}

/// Function sources: exactly one of `inline` or `gitRepository`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSource {
    /// Source code embedded in the Function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlineSource>,

    /// Source code fetched from git
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<GitRepositorySource>,
}

/// Which kind of source a Function uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceType {
    /// Inline source stored in a ConfigMap
    Inline,
    /// Git repository source
    Git,
}

// =============================================================================
// Workload shape
// =============================================================================

/// Resource requirements for the function container and the build Job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfiguration {
    /// Function container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ResourceRequirements>,

    /// Build Job resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ResourceRequirements>,
}

/// Autoscaling bounds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleConfig {
    /// Minimum replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Maximum replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
}

/// Secret mounted into the function container
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretMount {
    /// Secret name, also used as the volume name
    pub secret_name: String,

    /// Mount path inside the container
    pub mount_path: String,
}

// =============================================================================
// CRD
// =============================================================================

/// Function specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serverless.kyma-project.io",
    version = "v1alpha2",
    kind = "Function",
    plural = "functions",
    shortname = "fn",
    namespaced,
    status = "FunctionStatus",
    printcolumn = r#"{"name":"Configured","type":"string","jsonPath":".status.conditions[?(@.type=='ConfigurationReady')].status"}"#,
    printcolumn = r#"{"name":"Built","type":"string","jsonPath":".status.conditions[?(@.type=='BuildReady')].status"}"#,
    printcolumn = r#"{"name":"Running","type":"string","jsonPath":".status.conditions[?(@.type=='Running')].status"}"#,
    printcolumn = r#"{"name":"Runtime","type":"string","jsonPath":".spec.runtime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Runtime used to build and run the function
    pub runtime: Runtime,

    /// Base image replacing the runtime's default base image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_image_override: Option<String>,

    /// Function sources
    pub source: FunctionSource,

    /// Extra environment for the function container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Resource requirements for function and build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_configuration: Option<ResourceConfiguration>,

    /// Autoscaling bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_config: Option<ScaleConfig>,

    /// Replica count when autoscaling is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Extra pod labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Extra pod annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Secrets mounted into the function container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_mounts: Vec<SecretMount>,
}

/// Function status
///
/// Optional fields serialize as `null` so a merge patch clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    /// Conditions, at most one per type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Resolved git commit
    #[serde(default)]
    pub commit: Option<String>,

    /// Git reference the commit was resolved from
    #[serde(default)]
    pub reference: Option<String>,

    /// Base directory the commit was built from
    #[serde(default)]
    pub base_dir: Option<String>,

    /// Runtime the sources were resolved for
    #[serde(default)]
    pub runtime: Option<Runtime>,

    /// Runtime image override the sources were resolved for
    #[serde(default)]
    pub runtime_image_override: Option<String>,

    /// Tag of the image built for the current sources
    #[serde(default)]
    pub image_tag: Option<String>,
}

impl FunctionStatus {
    /// Status of the given condition type
    pub fn condition(&self, type_: ConditionType) -> ConditionStatus {
        condition_status(&self.conditions, type_)
    }
}

impl FunctionSpec {
    /// Which source kind is configured
    ///
    /// Git wins when both are set; [`FunctionSpec::validate`] rejects that case.
    pub fn source_type(&self) -> SourceType {
        if self.source.git_repository.is_some() {
            SourceType::Git
        } else {
            SourceType::Inline
        }
    }

    /// Runtime identity that affects the built image
    pub fn effective_runtime(&self) -> String {
        match self.runtime_image_override.as_deref() {
            Some(image) if !image.is_empty() => format!("{}-{}", self.runtime, image),
            _ => self.runtime.to_string(),
        }
    }

    /// Resolved (min, max) replica bounds
    ///
    /// Min defaults to 1 when absent or non-positive. Max falls back to min
    /// when absent or lower than min.
    pub fn replica_bounds(&self) -> (i32, i32) {
        let Some(scale) = self.scale_config.as_ref() else {
            return (1, 1);
        };
        let min = scale.min_replicas.filter(|m| *m > 0).unwrap_or(1);
        let max = match scale.max_replicas {
            Some(max) if max >= min => max,
            _ => min,
        };
        (min, max)
    }

    /// Autoscaling is active when the resolved bounds differ
    pub fn scaling_enabled(&self) -> bool {
        let (min, max) = self.replica_bounds();
        min != max
    }

    /// Replica count the Deployment carries when autoscaling is disabled
    pub fn expected_replicas(&self) -> i32 {
        self.replicas.unwrap_or_else(|| self.replica_bounds().0)
    }

    /// Validate the spec
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        match (&self.source.inline, &self.source.git_repository) {
            (Some(_), Some(_)) => {
                return Err(Error::validation_for(
                    name,
                    "source must set exactly one of inline or gitRepository, not both",
                ))
            }
            (None, None) => {
                return Err(Error::validation_for(
                    name,
                    "source must set one of inline or gitRepository",
                ))
            }
            (Some(inline), None) if inline.source.trim().is_empty() => {
                return Err(Error::validation_for(name, "inline source cannot be empty"))
            }
            (None, Some(git)) => {
                if git.url.trim().is_empty() {
                    return Err(Error::validation_for(name, "gitRepository.url cannot be empty"));
                }
                if git.reference.trim().is_empty() {
                    return Err(Error::validation_for(
                        name,
                        "gitRepository.reference cannot be empty",
                    ));
                }
            }
            _ => {}
        }

        if let Some(scale) = &self.scale_config {
            if scale.min_replicas.is_some_and(|m| m < 0) || scale.max_replicas.is_some_and(|m| m < 0)
            {
                return Err(Error::validation_for(name, "replica bounds cannot be negative"));
            }
        }
        if self.replicas.is_some_and(|r| r < 0) {
            return Err(Error::validation_for(name, "replicas cannot be negative"));
        }

        let mut seen = HashSet::new();
        for mount in &self.secret_mounts {
            if !seen.insert(mount.secret_name.as_str()) {
                return Err(Error::validation_for(
                    name,
                    format!("secret {} is mounted more than once", mount.secret_name),
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
