//! Function controller wiring
//!
//! The controller watches Functions and every object kind they own, so a
//! change to a ConfigMap, Job, Deployment, Service or autoscaler re-runs the
//! owning Function's pass.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use serverless_common::crd::Function;
use serverless_common::labels::{label_selector, managed_by_labels};
use serverless_function::{error_policy, forget_missing, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the Function controller until a shutdown signal arrives
pub async fn run_function_controller(client: Client, ctx: Arc<Context>) {
    let owned = WatcherConfig::default()
        .labels(&label_selector(&managed_by_labels()))
        .timeout(WATCH_TIMEOUT_SECS);
    let functions: Api<Function> = Api::all(client.clone());

    tracing::info!("- Function controller");

    Controller::new(functions, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(Api::<ConfigMap>::all(client.clone()), owned.clone())
        .owns(Api::<Job>::all(client.clone()), owned.clone())
        .owns(Api::<Deployment>::all(client.clone()), owned.clone())
        .owns(Api::<Service>::all(client.clone()), owned.clone())
        .owns(Api::<HorizontalPodAutoscaler>::all(client), owned)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Function", ctx))
        .await;
}

/// Creates a closure for logging reconciliation results.
///
/// Functions that left the store are forgotten so their backoff and phase
/// statistics do not outlive them.
fn log_reconcile_result<T, E, Q>(
    controller_name: &'static str,
    ctx: Arc<Context>,
) -> impl Fn(Result<T, controller::Error<E, Q>>) -> std::future::Ready<()>
where
    T: std::fmt::Debug,
    E: std::fmt::Debug + 'static,
    Q: std::fmt::Debug + 'static,
{
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e @ controller::Error::ObjectNotFound(_)) => forget_missing(&ctx, &e),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
