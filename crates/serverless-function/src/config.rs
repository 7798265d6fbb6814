//! Controller configuration
//!
//! Every duration the reconciler waits on is a [`RequeueConfig`] field so
//! deployments can tune the policy without a rebuild.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Requeue and backoff policy
#[derive(Clone, Debug, PartialEq)]
pub struct RequeueConfig {
    /// Admission gate is full; retry the build soon
    pub build_queue_full: Duration,
    /// Build Job failed; wait before inspecting it again
    pub build_failed: Duration,
    /// Function is running; periodic re-check
    pub function_ready: Duration,
    /// Git sources are polled at this interval
    pub git_fetch: Duration,
    /// Source resolver reported a non-recoverable error
    pub source_error: Duration,
    /// First delay for reconcile errors
    pub error_base: Duration,
    /// Cap for reconcile error backoff
    pub error_max: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            build_queue_full: Duration::from_secs(5),
            build_failed: Duration::from_secs(5 * 60),
            function_ready: Duration::from_secs(5 * 60),
            git_fetch: Duration::from_secs(30),
            source_error: Duration::from_secs(5 * 60),
            error_base: Duration::from_secs(5),
            error_max: Duration::from_secs(5 * 60),
        }
    }
}

/// Image build settings
#[derive(Clone, Debug, PartialEq)]
pub struct BuildConfig {
    /// Image of the build executor
    pub executor_image: String,
    /// Arguments passed to the executor before destination and context
    pub executor_args: Vec<String>,
    /// Image of the git repository fetcher init container
    pub repo_fetcher_image: String,
    /// Cap on build Jobs running at once across the cluster
    pub max_simultaneous_jobs: usize,
    /// Build resources when the Function sets none
    pub default_resources: ResourceRequirements,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            executor_image: "gcr.io/kaniko-project/executor:v1.9.2".to_string(),
            executor_args: [
                "--insecure",
                "--skip-tls-verify",
                "--skip-unused-stages",
                "--log-format=text",
                "--cache=true",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            repo_fetcher_image: "europe-docker.pkg.dev/kyma-project/prod/function-build-init:v1"
                .to_string(),
            max_simultaneous_jobs: 5,
            default_resources: resources("700m", "700Mi", "1100m", "1100Mi"),
        }
    }
}

/// Controller-wide settings
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionConfig {
    /// External registry secret (user provided)
    pub external_registry_secret: String,
    /// Default registry secret installed with the controller
    pub default_registry_secret: String,
    /// Optional package registry secret mounted into builds
    pub package_registry_secret: String,
    /// Service account of function pods
    pub image_pull_service_account: String,
    /// HPA CPU utilisation target
    pub target_cpu_utilization_percentage: i32,
    /// Exposed to functions as `TRACE_COLLECTOR_ENDPOINT`
    pub trace_collector_endpoint: String,
    /// Exposed to functions as `PUBLISHER_PROXY_ADDRESS`
    pub publisher_proxy_address: String,
    /// Function resources when the Function sets none
    pub default_function_resources: ResourceRequirements,
    /// Build settings
    pub build: BuildConfig,
    /// Requeue policy
    pub requeue: RequeueConfig,
    /// Health probe acknowledgement timeout
    pub health_timeout: Duration,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            external_registry_secret: "serverless-registry-config".to_string(),
            default_registry_secret: "serverless-registry-config-default".to_string(),
            package_registry_secret: "serverless-package-registry-config".to_string(),
            image_pull_service_account: "serverless-function".to_string(),
            target_cpu_utilization_percentage: 50,
            trace_collector_endpoint:
                "http://tracing-jaeger-collector.kyma-system.svc.cluster.local:14268/api/traces"
                    .to_string(),
            publisher_proxy_address:
                "http://eventing-publisher-proxy.kyma-system.svc.cluster.local/publish".to_string(),
            default_function_resources: resources("50m", "64Mi", "100m", "128Mi"),
            build: BuildConfig::default(),
            requeue: RequeueConfig::default(),
            health_timeout: Duration::from_secs(10),
        }
    }
}

impl FunctionConfig {
    /// Override the requeue policy
    pub fn with_requeue(mut self, requeue: RequeueConfig) -> Self {
        self.requeue = requeue;
        self
    }

    /// Override the build settings
    pub fn with_build(mut self, build: BuildConfig) -> Self {
        self.build = build;
        self
    }

    /// Override the admission gate capacity
    pub fn with_max_simultaneous_jobs(mut self, max: usize) -> Self {
        self.build.max_simultaneous_jobs = max;
        self
    }

    /// Override the health probe timeout
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }
}

/// Requests and limits for cpu and memory
pub fn resources(
    cpu_request: &str,
    memory_request: &str,
    cpu_limit: &str,
    memory_limit: &str,
) -> ResourceRequirements {
    let pair = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(pair(cpu_request, memory_request)),
        limits: Some(pair(cpu_limit, memory_limit)),
        ..Default::default()
    }
}
