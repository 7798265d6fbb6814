//! Command line and environment configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use serverless_function::{BuildConfig, FunctionConfig, RequeueConfig};

/// Function controller - builds and runs serverless Functions
#[derive(Parser, Debug)]
#[command(name = "function-controller", version, about, long_about = None)]
pub struct Cli {
    /// Print the Function CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Address of the /healthz endpoint
    #[arg(long, env = "APP_HEALTH_ADDRESS", default_value = "0.0.0.0:8090")]
    pub health_address: SocketAddr,

    /// Seconds the health probe waits for the reconciler
    #[arg(long, env = "APP_HEALTHZ_LIVENESS_TIMEOUT", default_value_t = 10)]
    pub health_timeout_secs: u64,

    /// Skip installing the Function CRD on startup
    #[arg(long, env = "APP_SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,

    /// User-provided registry secret name
    #[arg(long, env = "APP_FUNCTION_EXTERNAL_REGISTRY_SECRET", default_value = "serverless-registry-config")]
    pub external_registry_secret: String,

    /// Default registry secret name
    #[arg(long, env = "APP_FUNCTION_DEFAULT_REGISTRY_SECRET", default_value = "serverless-registry-config-default")]
    pub default_registry_secret: String,

    /// Package registry secret name mounted into builds
    #[arg(long, env = "APP_FUNCTION_PACKAGE_REGISTRY_SECRET", default_value = "serverless-package-registry-config")]
    pub package_registry_secret: String,

    /// Service account of function pods
    #[arg(long, env = "APP_FUNCTION_IMAGE_PULL_ACCOUNT_NAME", default_value = "serverless-function")]
    pub image_pull_service_account: String,

    /// Autoscaler CPU utilisation target
    #[arg(long, env = "APP_FUNCTION_TARGET_CPU_UTILIZATION_PERCENTAGE", default_value_t = 50)]
    pub target_cpu_utilization_percentage: i32,

    /// Trace collector endpoint exposed to functions
    #[arg(long, env = "APP_FUNCTION_TRACE_COLLECTOR_ENDPOINT")]
    pub trace_collector_endpoint: Option<String>,

    /// Event publisher proxy exposed to functions
    #[arg(long, env = "APP_FUNCTION_PUBLISHER_PROXY_ADDRESS")]
    pub publisher_proxy_address: Option<String>,

    /// Image of the build executor
    #[arg(long, env = "APP_FUNCTION_BUILD_EXECUTOR_IMAGE")]
    pub executor_image: Option<String>,

    /// Image of the git repository fetcher
    #[arg(long, env = "APP_FUNCTION_BUILD_REPOFETCHER_IMAGE")]
    pub repo_fetcher_image: Option<String>,

    /// Build Jobs allowed to run at once across the cluster
    #[arg(long, env = "APP_FUNCTION_BUILD_MAX_SIMULTANEOUS_JOBS", default_value_t = 5)]
    pub max_simultaneous_jobs: usize,

    /// Seconds before retrying a build rejected by the admission gate
    #[arg(long, env = "APP_FUNCTION_BUILD_QUEUE_FULL_REQUEUE", default_value_t = 5)]
    pub build_queue_full_secs: u64,

    /// Seconds before re-checking a failed build
    #[arg(long, env = "APP_FUNCTION_BUILD_FAILED_REQUEUE", default_value_t = 300)]
    pub build_failed_secs: u64,

    /// Seconds between checks of a running function
    #[arg(long, env = "APP_FUNCTION_READY_REQUEUE", default_value_t = 300)]
    pub function_ready_secs: u64,

    /// Seconds between git source polls
    #[arg(long, env = "APP_FUNCTION_GIT_FETCH_REQUEUE", default_value_t = 30)]
    pub git_fetch_secs: u64,

    /// Seconds before retrying a non-recoverable source error
    #[arg(long, env = "APP_FUNCTION_SOURCE_ERROR_REQUEUE", default_value_t = 300)]
    pub source_error_secs: u64,
}

impl Cli {
    /// Controller settings, starting from the defaults
    pub fn function_config(&self) -> FunctionConfig {
        let defaults = FunctionConfig::default();
        let build = BuildConfig {
            executor_image: self
                .executor_image
                .clone()
                .unwrap_or(defaults.build.executor_image.clone()),
            repo_fetcher_image: self
                .repo_fetcher_image
                .clone()
                .unwrap_or(defaults.build.repo_fetcher_image.clone()),
            max_simultaneous_jobs: self.max_simultaneous_jobs,
            ..defaults.build.clone()
        };
        let requeue = RequeueConfig {
            build_queue_full: Duration::from_secs(self.build_queue_full_secs),
            build_failed: Duration::from_secs(self.build_failed_secs),
            function_ready: Duration::from_secs(self.function_ready_secs),
            git_fetch: Duration::from_secs(self.git_fetch_secs),
            source_error: Duration::from_secs(self.source_error_secs),
            ..defaults.requeue.clone()
        };

        FunctionConfig {
            external_registry_secret: self.external_registry_secret.clone(),
            default_registry_secret: self.default_registry_secret.clone(),
            package_registry_secret: self.package_registry_secret.clone(),
            image_pull_service_account: self.image_pull_service_account.clone(),
            target_cpu_utilization_percentage: self.target_cpu_utilization_percentage,
            trace_collector_endpoint: self
                .trace_collector_endpoint
                .clone()
                .unwrap_or(defaults.trace_collector_endpoint.clone()),
            publisher_proxy_address: self
                .publisher_proxy_address
                .clone()
                .unwrap_or(defaults.publisher_proxy_address.clone()),
            ..defaults
        }
        .with_build(build)
        .with_requeue(requeue)
        .with_health_timeout(Duration::from_secs(self.health_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let cli = Cli::try_parse_from(["function-controller"]).unwrap();
        assert!(!cli.crd);
        assert_eq!(cli.function_config(), FunctionConfig::default());
    }

    #[test]
    fn durations_are_configurable() {
        let cli = Cli::try_parse_from([
            "function-controller",
            "--git-fetch-secs",
            "60",
            "--max-simultaneous-jobs",
            "2",
            "--executor-image",
            "executor:test",
        ])
        .unwrap();
        let config = cli.function_config();
        assert_eq!(config.requeue.git_fetch, Duration::from_secs(60));
        assert_eq!(config.build.max_simultaneous_jobs, 2);
        assert_eq!(config.build.executor_image, "executor:test");
        assert_eq!(config.requeue.function_ready, Duration::from_secs(300));
    }

    #[test]
    fn crd_flag() {
        let cli = Cli::try_parse_from(["function-controller", "--crd"]).unwrap();
        assert!(cli.crd);
    }
}
