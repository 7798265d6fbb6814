//! Per-pass view of a Function and the objects it owns
//!
//! The snapshot is read once at the start of a pass. Stages decide from it
//! and write through the client; only the Function status is carried forward
//! within the pass so later stages see conditions written by earlier ones.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use serverless_common::crd::{
    ConditionStatus, ConditionType, Function, FunctionStatus, SourceType,
};
use serverless_common::labels::{
    internal_function_labels, merge_labels, FUNCTION_RESOURCE_DEPLOYMENT_VALUE,
    FUNCTION_RESOURCE_LABEL,
};
use serverless_common::Error;

use crate::client::KubeClient;
use crate::docker::DockerConfig;
use crate::resources::configmap::{FUNCTION_DEPS_KEY, FUNCTION_SOURCE_KEY};
use crate::runtime::sanitize_dependencies;

/// Pod annotation kept from the live Deployment so `kubectl rollout restart` sticks
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

const ISTIO_CONFIG_ANNOTATION: &str = "proxy.istio.io/config";
const ISTIO_HOLD_UNTIL_PROXY_STARTS: &str = "{ \"holdApplicationUntilProxyStarts\": true }";

const MINIMUM_REPLICAS_AVAILABLE: &str = "MinimumReplicasAvailable";
const MINIMUM_REPLICAS_UNAVAILABLE: &str = "MinimumReplicasUnavailable";
const NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";

/// Rollout state derived from Deployment conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentReadiness {
    /// Available and the newest ReplicaSet is serving
    Ready,
    /// Lost minimum availability; expected to recover
    Degraded,
    /// Rollout still in progress
    Progressing,
    /// Anything else
    Failed,
}

/// Snapshot of one Function and its owned objects
#[derive(Clone, Debug)]
pub struct SystemState {
    /// The Function as read at the start of the pass
    pub function: Function,
    /// Function name
    pub name: String,
    /// Function namespace
    pub namespace: String,
    /// Function UID
    pub uid: String,
    /// Status as written so far in this pass
    pub status: FunctionStatus,
    /// Owned ConfigMaps
    pub config_maps: Vec<ConfigMap>,
    /// Owned build Jobs
    pub jobs: Vec<Job>,
    /// Owned Deployments
    pub deployments: Vec<Deployment>,
    /// Owned Services
    pub services: Vec<Service>,
    /// Owned autoscalers
    pub hpas: Vec<HorizontalPodAutoscaler>,
    /// Registry settings for the namespace
    pub docker: DockerConfig,
}

impl SystemState {
    /// Snapshot without owned objects
    pub fn new(function: Function, docker: DockerConfig) -> Result<Self, Error> {
        let name = function.name_any();
        let namespace = function
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "Function must be namespaced"))?;
        let uid = function
            .uid()
            .ok_or_else(|| Error::internal_with_context("snapshot", "Function has no UID"))?;
        let status = function.status.clone().unwrap_or_default();
        Ok(Self {
            function,
            name,
            namespace,
            uid,
            status,
            config_maps: Vec::new(),
            jobs: Vec::new(),
            deployments: Vec::new(),
            services: Vec::new(),
            hpas: Vec::new(),
            docker,
        })
    }

    /// Snapshot with every owned object listed by the internal label set
    pub async fn load(
        client: &dyn KubeClient,
        function: Function,
        docker: DockerConfig,
    ) -> Result<Self, Error> {
        let mut state = Self::new(function, docker)?;
        let labels = state.internal_labels();
        let ns = state.namespace.clone();
        state.config_maps = client.list_config_maps(&ns, &labels).await?;
        state.jobs = client.list_jobs(&ns, &labels).await?;
        state.deployments = client.list_deployments(&ns, &labels).await?;
        state.services = client.list_services(&ns, &labels).await?;
        state.hpas = client.list_hpas(&ns, &labels).await?;
        Ok(state)
    }

    // =========================================================================
    // Labels and annotations
    // =========================================================================

    /// Labels identifying objects owned by this Function
    pub fn internal_labels(&self) -> BTreeMap<String, String> {
        internal_function_labels(&self.name, &self.uid)
    }

    /// Labels of owned objects: Function metadata labels plus internal labels
    pub fn function_labels(&self) -> BTreeMap<String, String> {
        merge_labels(self.function.metadata.labels.as_ref(), self.internal_labels())
    }

    /// Deployment selector; must stay stable over the Deployment's life
    pub fn deployment_selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.internal_labels();
        labels.insert(
            FUNCTION_RESOURCE_LABEL.to_string(),
            FUNCTION_RESOURCE_DEPLOYMENT_VALUE.to_string(),
        );
        labels
    }

    /// Pod template labels: spec labels plus the selector
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        merge_labels(
            self.function.spec.labels.as_ref(),
            self.deployment_selector_labels(),
        )
    }

    /// Pod template annotations
    pub fn pod_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        if let Some(restarted_at) = self
            .deployments
            .first()
            .and_then(|d| d.spec.as_ref())
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(RESTARTED_AT_ANNOTATION))
        {
            annotations.insert(RESTARTED_AT_ANNOTATION.to_string(), restarted_at.clone());
        }
        if let Some(user) = &self.function.spec.annotations {
            annotations.extend(user.clone());
        }
        annotations.insert(
            ISTIO_CONFIG_ANNOTATION.to_string(),
            ISTIO_HOLD_UNTIL_PROXY_STARTS.to_string(),
        );
        annotations
    }

    /// Controller owner reference pointing at the Function
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.function.controller_owner_ref(&())
    }

    // =========================================================================
    // Image
    // =========================================================================

    /// Tag of the image built from the current sources
    pub fn image_tag(&self) -> String {
        match self.function.spec.source_type() {
            SourceType::Git => self.git_image_tag(
                self.status.commit.as_deref().unwrap_or_default(),
                self.status.base_dir.as_deref().unwrap_or_default(),
            ),
            SourceType::Inline => {
                let (source, dependencies) = self
                    .function
                    .spec
                    .source
                    .inline
                    .as_ref()
                    .map(|i| (i.source.as_str(), i.dependencies.as_str()))
                    .unwrap_or_default();
                sha256_hex(&format!(
                    "{}-{{{} {}}}-{}",
                    self.uid,
                    source,
                    dependencies,
                    self.function.spec.effective_runtime()
                ))
            }
        }
    }

    /// Tag of the image built from a git revision
    pub fn git_image_tag(&self, commit: &str, base_dir: &str) -> String {
        sha256_hex(&format!(
            "{}-{}-{}-{}",
            self.uid,
            commit,
            base_dir,
            self.function.spec.effective_runtime()
        ))
    }

    /// Full image reference in `registry`
    pub fn image_address(&self, registry: &str) -> String {
        format!(
            "{}/{}-{}:{}",
            registry,
            self.namespace,
            self.name,
            self.image_tag()
        )
    }

    // =========================================================================
    // Source drift
    // =========================================================================

    fn condition(&self, type_: ConditionType) -> ConditionStatus {
        self.status.condition(type_)
    }

    /// Inline sources differ from the stored ConfigMap or were never confirmed
    pub fn inline_source_changed(&self) -> bool {
        let Some(inline) = self.function.spec.source.inline.as_ref() else {
            return false;
        };
        let [cm] = self.config_maps.as_slice() else {
            return true;
        };
        let data = cm.data.clone().unwrap_or_default();
        let deps = sanitize_dependencies(self.function.spec.runtime, &inline.dependencies);

        let up_to_date = data.get(FUNCTION_SOURCE_KEY) == Some(&inline.source)
            && data.get(FUNCTION_DEPS_KEY) == Some(&deps)
            && cm.metadata.labels.clone().unwrap_or_default() == self.function_labels()
            && self.status.image_tag.as_deref() == Some(self.image_tag().as_str())
            && self.condition(ConditionType::ConfigurationReady) == ConditionStatus::True;
        !up_to_date
    }

    /// The resolved git revision or the spec fields it was resolved for changed
    pub fn git_source_changed(&self, commit: &str) -> bool {
        let Some(git) = self.function.spec.source.git_repository.as_ref() else {
            return false;
        };
        let status = &self.status;
        let stored_commit = status.commit.as_deref().unwrap_or_default();
        stored_commit.is_empty()
            || commit != stored_commit
            || status.reference.as_deref() != Some(git.reference.as_str())
            || status.base_dir.as_deref() != Some(git.base_dir.as_str())
            || status.runtime != Some(self.function.spec.runtime)
            || status.runtime_image_override != self.function.spec.runtime_image_override
            || self.condition(ConditionType::ConfigurationReady) == ConditionStatus::False
    }

    // =========================================================================
    // Deployment status
    // =========================================================================

    /// Rollout state of the single owned Deployment
    pub fn deployment_readiness(&self) -> DeploymentReadiness {
        let Some(deployment) = self.deployments.first() else {
            return DeploymentReadiness::Failed;
        };
        let condition = |type_: &str| {
            deployment
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|cs| cs.iter().find(|c| c.type_ == type_))
                .map(|c| (c.status.as_str(), c.reason.as_deref().unwrap_or_default()))
        };
        let available = condition("Available");
        let progressing = condition("Progressing");

        if available == Some(("True", MINIMUM_REPLICAS_AVAILABLE))
            && progressing == Some(("True", NEW_REPLICA_SET_AVAILABLE))
        {
            DeploymentReadiness::Ready
        } else if available == Some(("False", MINIMUM_REPLICAS_UNAVAILABLE)) {
            DeploymentReadiness::Degraded
        } else if progressing.is_some_and(|(status, _)| status == "True") {
            DeploymentReadiness::Progressing
        } else {
            DeploymentReadiness::Failed
        }
    }

    /// Deployment conditions serialized for a failure message
    pub fn deployment_conditions_json(&self) -> String {
        self.deployments
            .first()
            .and_then(|d| d.status.as_ref())
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| serde_json::to_string(c).ok())
            .unwrap_or_else(|| "[]".to_string())
    }
}

fn sha256_hex(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use kube::api::ObjectMeta;
    use serverless_common::crd::{
        Condition, ConditionReason, FunctionSource, FunctionSpec, GitRepositorySource,
        InlineSource, Runtime,
    };

    pub(crate) fn inline_function(name: &str) -> Function {
        let mut function = Function::new(
            name,
            FunctionSpec {
                runtime: Runtime::NodeJs18,
                source: FunctionSource {
                    inline: Some(InlineSource {
                        source: "module.exports = { main: () => 'hello' }".to_string(),
                        dependencies: String::new(),
                    }),
                    git_repository: None,
                },
                ..Default::default()
            },
        );
        function.metadata.namespace = Some("default".to_string());
        function.metadata.uid = Some(format!("{name}-uid"));
        function.metadata.generation = Some(1);
        function
    }

    pub(crate) fn git_function(name: &str) -> Function {
        let mut function = inline_function(name);
        function.spec.runtime = Runtime::Python39;
        function.spec.source = FunctionSource {
            inline: None,
            git_repository: Some(GitRepositorySource {
                url: "https://github.com/example/functions.git".to_string(),
                reference: "main".to_string(),
                base_dir: "/hello".to_string(),
                auth: None,
            }),
        };
        function
    }

    pub(crate) fn docker() -> DockerConfig {
        DockerConfig {
            active_secret: "serverless-registry-config-default".to_string(),
            push_address: "registry.kyma-system.svc:5000".to_string(),
            pull_address: "localhost:32137".to_string(),
        }
    }

    pub(crate) fn state(function: Function) -> SystemState {
        SystemState::new(function, docker()).unwrap()
    }

    fn configured(state: &mut SystemState) {
        state.status.conditions = vec![Condition::new(
            ConditionType::ConfigurationReady,
            ConditionStatus::True,
            ConditionReason::ConfigMapCreated,
            "created",
        )];
        state.status.image_tag = Some(state.image_tag());
    }

    fn stored_config_map(state: &SystemState) -> ConfigMap {
        let inline = state.function.spec.source.inline.clone().unwrap();
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("hello-abcde".to_string()),
                labels: Some(state.function_labels()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (FUNCTION_SOURCE_KEY.to_string(), inline.source),
                (FUNCTION_DEPS_KEY.to_string(), "{}".to_string()),
            ])),
            ..Default::default()
        }
    }

    mod labels {
        use super::*;
        use serverless_common::labels::FUNCTION_UUID_LABEL;

        #[test]
        fn pod_labels_keep_selector_over_user_labels() {
            let mut function = inline_function("hello");
            function.spec.labels = Some(BTreeMap::from([
                (FUNCTION_UUID_LABEL.to_string(), "forged".to_string()),
                ("app".to_string(), "hello".to_string()),
            ]));
            let state = state(function);
            let labels = state.pod_labels();
            assert_eq!(labels[FUNCTION_UUID_LABEL], "hello-uid");
            assert_eq!(labels["app"], "hello");
            assert_eq!(labels[FUNCTION_RESOURCE_LABEL], "deployment");
        }

        #[test]
        fn metadata_labels_flow_into_function_labels() {
            let mut function = inline_function("hello");
            function.metadata.labels =
                Some(BTreeMap::from([("team".to_string(), "a".to_string())]));
            let labels = state(function).function_labels();
            assert_eq!(labels["team"], "a");
            assert_eq!(labels.len(), 4);
        }

        #[test]
        fn restarted_at_annotation_is_preserved() {
            let mut state = state(inline_function("hello"));
            let mut deployment = Deployment::default();
            let mut spec = k8s_openapi::api::apps::v1::DeploymentSpec::default();
            spec.template.metadata = Some(ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    RESTARTED_AT_ANNOTATION.to_string(),
                    "2024-01-01T00:00:00Z".to_string(),
                )])),
                ..Default::default()
            });
            deployment.spec = Some(spec);
            state.deployments = vec![deployment];

            let annotations = state.pod_annotations();
            assert_eq!(annotations[RESTARTED_AT_ANNOTATION], "2024-01-01T00:00:00Z");
            assert!(annotations.contains_key(ISTIO_CONFIG_ANNOTATION));
        }
    }

    mod image {
        use super::*;

        #[test]
        fn tag_is_deterministic_hex() {
            let a = state(inline_function("hello"));
            let b = state(inline_function("hello"));
            assert_eq!(a.image_tag(), b.image_tag());
            assert_eq!(a.image_tag().len(), 64);
            assert!(a.image_tag().chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn tag_changes_with_source_runtime_and_uid() {
            let base = state(inline_function("hello")).image_tag();

            let mut changed = inline_function("hello");
            changed.spec.source.inline.as_mut().unwrap().source = "other".to_string();
            assert_ne!(state(changed).image_tag(), base);

            let mut runtime = inline_function("hello");
            runtime.spec.runtime = Runtime::NodeJs16;
            assert_ne!(state(runtime).image_tag(), base);

            let mut uid = inline_function("hello");
            uid.metadata.uid = Some("other".to_string());
            assert_ne!(state(uid).image_tag(), base);
        }

        #[test]
        fn git_tag_follows_status_commit() {
            let mut s = state(git_function("hello"));
            s.status.commit = Some("abc".to_string());
            s.status.base_dir = Some("/hello".to_string());
            assert_eq!(s.image_tag(), s.git_image_tag("abc", "/hello"));
        }

        #[test]
        fn address_has_namespace_name_and_tag() {
            let s = state(inline_function("hello"));
            let address = s.image_address("localhost:32137");
            assert_eq!(
                address,
                format!("localhost:32137/default-hello:{}", s.image_tag())
            );
        }
    }

    mod inline_drift {
        use super::*;

        #[test]
        fn no_config_map_means_changed() {
            assert!(state(inline_function("hello")).inline_source_changed());
        }

        #[test]
        fn matching_config_map_and_true_condition_is_unchanged() {
            let mut s = state(inline_function("hello"));
            configured(&mut s);
            s.config_maps = vec![stored_config_map(&s)];
            assert!(!s.inline_source_changed());
        }

        #[test]
        fn source_edit_is_detected() {
            let mut s = state(inline_function("hello"));
            configured(&mut s);
            s.config_maps = vec![stored_config_map(&s)];
            s.function.spec.source.inline.as_mut().unwrap().source = "changed".to_string();
            assert!(s.inline_source_changed());
        }

        #[test]
        fn label_drift_is_detected() {
            let mut s = state(inline_function("hello"));
            configured(&mut s);
            let mut cm = stored_config_map(&s);
            cm.metadata.labels = Some(BTreeMap::new());
            s.config_maps = vec![cm];
            assert!(s.inline_source_changed());
        }

        #[test]
        fn runtime_change_is_detected_through_image_tag() {
            let mut s = state(inline_function("hello"));
            configured(&mut s);
            s.config_maps = vec![stored_config_map(&s)];
            s.function.spec.runtime = Runtime::NodeJs16;
            assert!(s.inline_source_changed());
        }

        #[test]
        fn duplicated_config_maps_mean_changed() {
            let mut s = state(inline_function("hello"));
            configured(&mut s);
            s.config_maps = vec![stored_config_map(&s), stored_config_map(&s)];
            assert!(s.inline_source_changed());
        }
    }

    mod git_drift {
        use super::*;

        fn resolved(s: &mut SystemState, commit: &str) {
            s.status.commit = Some(commit.to_string());
            s.status.reference = Some("main".to_string());
            s.status.base_dir = Some("/hello".to_string());
            s.status.runtime = Some(Runtime::Python39);
            s.status.conditions = vec![Condition::new(
                ConditionType::ConfigurationReady,
                ConditionStatus::True,
                ConditionReason::SourceUpdated,
                "updated",
            )];
        }

        #[test]
        fn empty_commit_is_always_changed() {
            let mut s = state(git_function("hello"));
            resolved(&mut s, "");
            assert!(s.git_source_changed(""));
        }

        #[test]
        fn same_commit_is_unchanged() {
            let mut s = state(git_function("hello"));
            resolved(&mut s, "abc");
            assert!(!s.git_source_changed("abc"));
        }

        #[test]
        fn new_commit_is_changed() {
            let mut s = state(git_function("hello"));
            resolved(&mut s, "abc");
            assert!(s.git_source_changed("def"));
        }

        #[test]
        fn reference_edit_is_changed() {
            let mut s = state(git_function("hello"));
            resolved(&mut s, "abc");
            s.function
                .spec
                .source
                .git_repository
                .as_mut()
                .unwrap()
                .reference = "dev".to_string();
            assert!(s.git_source_changed("abc"));
        }

        #[test]
        fn false_condition_forces_change() {
            let mut s = state(git_function("hello"));
            resolved(&mut s, "abc");
            s.status.conditions[0].status = ConditionStatus::False;
            assert!(s.git_source_changed("abc"));
        }
    }

    mod readiness {
        use super::*;

        fn with_conditions(conditions: &[(&str, &str, &str)]) -> SystemState {
            let mut s = state(inline_function("hello"));
            s.deployments = vec![Deployment {
                status: Some(DeploymentStatus {
                    conditions: Some(
                        conditions
                            .iter()
                            .map(|(t, st, r)| DeploymentCondition {
                                type_: t.to_string(),
                                status: st.to_string(),
                                reason: Some(r.to_string()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }];
            s
        }

        #[test]
        fn available_and_new_replica_set_is_ready() {
            let s = with_conditions(&[
                ("Available", "True", "MinimumReplicasAvailable"),
                ("Progressing", "True", "NewReplicaSetAvailable"),
            ]);
            assert_eq!(s.deployment_readiness(), DeploymentReadiness::Ready);
        }

        #[test]
        fn minimum_replicas_unavailable_is_degraded() {
            let s = with_conditions(&[
                ("Available", "False", "MinimumReplicasUnavailable"),
                ("Progressing", "True", "ReplicaSetUpdated"),
            ]);
            assert_eq!(s.deployment_readiness(), DeploymentReadiness::Degraded);
        }

        #[test]
        fn rollout_in_progress_is_progressing() {
            let s = with_conditions(&[
                ("Available", "True", "MinimumReplicasAvailable"),
                ("Progressing", "True", "ReplicaSetUpdated"),
            ]);
            assert_eq!(s.deployment_readiness(), DeploymentReadiness::Progressing);
        }

        #[test]
        fn deadline_exceeded_is_failed() {
            let s = with_conditions(&[("Progressing", "False", "ProgressDeadlineExceeded")]);
            assert_eq!(s.deployment_readiness(), DeploymentReadiness::Failed);
            assert!(s.deployment_conditions_json().contains("ProgressDeadlineExceeded"));
        }
    }
}
