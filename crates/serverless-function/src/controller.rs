//! Function controller entry points
//!
//! [`reconcile`] loads a fresh snapshot for the Function and runs the stage
//! chain from the source stage. [`error_policy`] turns errors into a
//! per-Function exponential backoff that a successful pass resets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::{self, Action};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use serverless_common::crd::{Condition, ConditionReason, ConditionStatus, ConditionType, Function};
use serverless_common::events::{EventPublisher, KubeEventPublisher};
use serverless_common::metrics::ReconcileTimer;
use serverless_common::retry::{jitter, RetryConfig};
use serverless_common::{Error, FIELD_MANAGER};

use crate::client::{KubeClient, KubeClientImpl};
use crate::config::FunctionConfig;
use crate::docker::{resolve_docker_config, DockerConfig};
use crate::fsm::{run_chain, FunctionPass, Stage};
use crate::gate::BuildGate;
use crate::health::{is_health_check, HealthResponder, HEALTH_CHECK_NAME, HEALTH_CHECK_NAMESPACE};
use crate::phases::set_condition;
use crate::snapshot::SystemState;
use crate::source::{Git2Resolver, SourceResolver};
use crate::stats::{PhaseStatsCollector, StatsCollector};

/// Shared context for the Function controller
///
/// Collaborators are trait objects so tests can swap in fakes. Use
/// [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .health(responder)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn KubeClient>,
    /// Resolves git references to commits
    pub resolver: Arc<dyn SourceResolver>,
    /// Receives every persisted condition
    pub stats: Arc<dyn StatsCollector>,
    /// Publishes Events on Functions
    pub events: Arc<dyn EventPublisher>,
    /// Controller settings
    pub config: FunctionConfig,
    /// Cluster-wide build admission
    pub gate: BuildGate,
    /// Acknowledges health probes; probes fail when unset
    pub health: Option<HealthResponder>,
    /// Cancelled on shutdown; aborts running passes between stages
    pub cancel: CancellationToken,
    /// Consecutive failures per `namespace/name`
    failures: Mutex<HashMap<String, u32>>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with an in-memory Kubernetes client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, stats: Arc<dyn StatsCollector>) -> Self {
        let config = FunctionConfig::default();
        Self {
            kube,
            resolver: Arc::new(crate::source::MockSourceResolver::new()),
            stats,
            events: Arc::new(serverless_common::events::NoopEventPublisher),
            gate: BuildGate::new(config.build.max_simultaneous_jobs),
            config,
            health: None,
            cancel: CancellationToken::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: self.config.requeue.error_base,
            max_delay: self.config.requeue.error_max,
            backoff_multiplier: 2.0,
        }
    }

    /// Count one more failure for `key` and return the un-jittered delay
    fn next_backoff(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        self.backoff().delay_for(*count)
    }

    fn reset_backoff(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    /// Drop the backoff and phase statistics kept for `namespace/name`
    ///
    /// Called once the Function is gone; the controller no longer schedules
    /// passes for it, so nothing else would clear these entries.
    pub fn forget(&self, namespace: &str, name: &str) {
        self.reset_backoff(&object_key(namespace, name));
        self.stats.forget_function(namespace, name);
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    resolver: Option<Arc<dyn SourceResolver>>,
    stats: Option<Arc<dyn StatsCollector>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: FunctionConfig,
    health: Option<HealthResponder>,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            resolver: None,
            stats: None,
            events: None,
            config: FunctionConfig::default(),
            health: None,
            cancel: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the git source resolver
    pub fn resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the stats collector
    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the controller settings
    pub fn config(mut self, config: FunctionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the health probe responder
    pub fn health(mut self, responder: HealthResponder) -> Self {
        self.health = Some(responder);
        self
    }

    /// Use an externally owned cancellation token
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(Git2Resolver)),
            stats: self
                .stats
                .unwrap_or_else(|| Arc::new(PhaseStatsCollector::new())),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, FIELD_MANAGER))),
            gate: BuildGate::new(self.config.build.max_simultaneous_jobs),
            config: self.config,
            health: self.health,
            cancel: self.cancel.unwrap_or_default(),
            failures: Mutex::new(HashMap::new()),
        }
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Reconcile a Function
///
/// The object handed in by the watcher only provides the key; the Function
/// and everything it owns are read again so the pass works on one snapshot.
#[instrument(skip(function, ctx), fields(function = %function.name_any(), namespace = %function.namespace().unwrap_or_default()))]
pub async fn reconcile(function: Arc<Function>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = function.namespace().unwrap_or_default();
    reconcile_key(&ctx, &namespace, &function.name_any()).await
}

/// Reconcile the Function stored under `namespace/name`
pub async fn reconcile_key(ctx: &Context, namespace: &str, name: &str) -> Result<Action, Error> {
    if is_health_check(name) {
        match &ctx.health {
            Some(health) => {
                if let Err(e) = health.acknowledge().await {
                    warn!(error = %e, "health check not acknowledged");
                }
            }
            None => debug!("health check without responder"),
        }
        return Ok(Action::await_change());
    }

    let timer = ReconcileTimer::start();
    let result = match reconcile_function(ctx, namespace, name).await {
        Err(e) if e.is_not_found() => {
            debug!(function = %name, error = %e, "function deleted during the pass");
            ctx.forget(namespace, name);
            Ok(Action::await_change())
        }
        other => other,
    };
    match &result {
        Ok(_) => {
            timer.success();
            ctx.reset_backoff(&object_key(namespace, name));
        }
        Err(e) => timer.error(e.is_retryable()),
    }
    result
}

async fn reconcile_function(ctx: &Context, namespace: &str, name: &str) -> Result<Action, Error> {
    let Some(function) = ctx.kube.get_function(namespace, name).await? else {
        debug!(function = %name, "function no longer exists");
        ctx.forget(namespace, name);
        return Ok(Action::await_change());
    };

    if function.metadata.deletion_timestamp.is_some() {
        ctx.forget(namespace, name);
        debug!(function = %name, "function is being deleted, owned objects are garbage collected");
        return Ok(Action::await_change());
    }

    if let Err(e) = function.spec.validate(name) {
        info!(function = %name, error = %e, "function failed validation");
        let mut state = SystemState::new(function, DockerConfig::default())?;
        set_condition(
            ctx,
            &mut state,
            Condition::new(
                ConditionType::ConfigurationReady,
                ConditionStatus::False,
                ConditionReason::ValidationFailed,
                e.to_string(),
            ),
        )
        .await?;
        return Ok(Action::await_change());
    }

    let docker = resolve_docker_config(ctx.kube.as_ref(), namespace, &ctx.config).await?;
    let mut state = SystemState::load(ctx.kube.as_ref(), function, docker).await?;
    let mut pass = FunctionPass::new(ctx, &mut state);
    let outcome = run_chain(&mut pass, Stage::Source, &ctx.cancel).await?;
    debug!(function = %name, ?outcome, "pass finished");
    Ok(outcome.into())
}

/// Error policy for the Function controller
///
/// Retryable errors back off exponentially with jitter per Function.
/// Errors that need a change in the cluster wait the maximum delay.
pub fn error_policy(function: Arc<Function>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = function.name_any();
    let namespace = function.namespace().unwrap_or_default();

    if matches!(error, Error::Cancelled) {
        debug!(function = %name, "pass cancelled");
        return Action::await_change();
    }

    if !error.is_retryable() {
        error!(?error, function = %name, namespace = %namespace, "reconciliation failed");
        return Action::requeue(ctx.config.requeue.error_max);
    }

    let delay = jitter(ctx.next_backoff(&object_key(&namespace, &name)));
    warn!(
        ?error,
        function = %name,
        namespace = %namespace,
        retry_in = ?delay,
        "reconciliation failed, retrying"
    );
    Action::requeue(delay)
}

/// Drop per-Function state when the controller reports a Function gone from its store
///
/// A Function deleted while a retry is pending never reaches [`reconcile`]
/// again, so this is the only place its backoff and statistics are cleared.
pub fn forget_missing<E: 'static, Q: 'static>(ctx: &Context, error: &controller::Error<E, Q>) {
    if let controller::Error::ObjectNotFound(obj) = error {
        debug!(function = %obj.name, "function left the store");
        ctx.forget(obj.namespace.as_deref().unwrap_or_default(), &obj.name);
    }
}

/// Serve health probe requests until the channel closes or the context is cancelled
pub async fn run_health_worker(ctx: Arc<Context>, mut requests: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
                if let Err(e) = reconcile_key(&ctx, HEALTH_CHECK_NAMESPACE, &HEALTH_CHECK_NAME).await {
                    warn!(error = %e, "health check reconcile failed");
                }
            }
        }
    }
    debug!("health worker stopped");
}
