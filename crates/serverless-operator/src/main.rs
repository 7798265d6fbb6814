//! Function controller - reconciles serverless Functions into builds and Deployments

mod cli;
mod controller_runner;
mod health_server;

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tokio_util::sync::CancellationToken;

use serverless_common::crd::Function;
use serverless_common::retry::{retry_with_backoff, RetryConfig};
use serverless_common::telemetry::{init_telemetry, TelemetryConfig};
use serverless_common::FIELD_MANAGER;
use serverless_function::{health_channels, run_health_worker, Context};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Function::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let config = cli.function_config();
    let client = Client::try_default().await?;

    if !cli.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let cancel = CancellationToken::new();
    let (checker, responder, requests) = health_channels(config.health_timeout);
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .health(responder)
            .cancellation(cancel.clone())
            .build(),
    );

    tokio::spawn(run_health_worker(ctx.clone(), requests));
    let health = tokio::spawn(health_server::serve(
        cli.health_address,
        Arc::new(checker),
        cancel.clone(),
    ));
    tokio::spawn(cancel_on_signal(cancel.clone()));

    controller_runner::run_function_controller(client, ctx).await;

    cancel.cancel();
    if let Err(e) = health.await? {
        tracing::warn!(error = %e, "health endpoint stopped with error");
    }
    tracing::info!("function controller stopped");
    Ok(())
}

/// Install the Function CRD with server-side apply
///
/// The controller owns its CRD so the schema always matches the binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = Function::crd();
    let name = crd.name_any();

    tracing::info!(crd = %name, "Installing Function CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(10), "install Function CRD", || {
        let crds = crds.clone();
        let params = params.clone();
        let crd = crd.clone();
        let name = name.clone();
        async move { crds.patch(&name, &params, &Patch::Apply(&crd)).await }
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Function CRD: {}", e))?;

    tracing::info!("Function CRD installed/updated");
    Ok(())
}

/// Cancel running passes as soon as shutdown is requested
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown requested, cancelling running passes");
    cancel.cancel();
}
