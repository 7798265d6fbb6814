//! Stage machine driving one reconcile pass
//!
//! Stages run in a fixed order. Each stage either hands over to its
//! successor or finishes the pass with an [`Outcome`]. The trampoline only
//! sequences stages and checks for cancellation between them; every API
//! write happens inside a stage.

use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use serverless_common::Error;

use crate::controller::Context;
use crate::phases;
use crate::snapshot::SystemState;

/// Reconcile stages in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Materialize sources (ConfigMap or resolved commit)
    Source,
    /// Run the image build Job
    Build,
    /// Create or update the Deployment
    Deployment,
    /// Create or update the Service
    Service,
    /// Create, update or remove the autoscaler
    Autoscaling,
    /// Derive the Running condition from the rollout state
    DeploymentStatus,
}

impl Stage {
    /// Successor of this stage, `None` after the last one
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Source => Some(Stage::Build),
            Stage::Build => Some(Stage::Deployment),
            Stage::Deployment => Some(Stage::Service),
            Stage::Service => Some(Stage::Autoscaling),
            Stage::Autoscaling => Some(Stage::DeploymentStatus),
            Stage::DeploymentStatus => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Build => "build",
            Stage::Deployment => "deployment",
            Stage::Service => "service",
            Stage::Autoscaling => "autoscaling",
            Stage::DeploymentStatus => "deployment-status",
        };
        f.write_str(name)
    }
}

/// How a pass ends
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the next watch event
    AwaitChange,
    /// Run again after the delay
    Requeue(Duration),
}

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::AwaitChange => Action::await_change(),
            Outcome::Requeue(after) => Action::requeue(after),
        }
    }
}

/// Result of one stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageResult {
    /// Everything this stage owns is up to date
    Continue,
    /// Stop the pass here
    Finish(Outcome),
}

/// Runs a single stage against some state
#[async_trait]
pub trait StageExecutor: Send {
    /// Execute `stage`
    async fn execute(&mut self, stage: Stage) -> Result<StageResult, Error>;
}

/// Run stages from `start` until one finishes the pass or the last one continues
pub async fn run_chain<E>(
    executor: &mut E,
    start: Stage,
    cancel: &CancellationToken,
) -> Result<Outcome, Error>
where
    E: StageExecutor + ?Sized,
{
    let mut stage = start;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!(%stage, "running stage");
        match executor.execute(stage).await? {
            StageResult::Finish(outcome) => return Ok(outcome),
            StageResult::Continue => match stage.next() {
                Some(next) => stage = next,
                None => return Ok(Outcome::AwaitChange),
            },
        }
    }
}

/// One Function's pass: the stages executed against its snapshot
pub struct FunctionPass<'a> {
    ctx: &'a Context,
    state: &'a mut SystemState,
}

impl<'a> FunctionPass<'a> {
    /// Pass over `state`
    pub fn new(ctx: &'a Context, state: &'a mut SystemState) -> Self {
        Self { ctx, state }
    }
}

#[async_trait]
impl StageExecutor for FunctionPass<'_> {
    async fn execute(&mut self, stage: Stage) -> Result<StageResult, Error> {
        match stage {
            Stage::Source => phases::source::reconcile_source(self.ctx, self.state).await,
            Stage::Build => phases::build::reconcile_build(self.ctx, self.state).await,
            Stage::Deployment => {
                phases::deployment::reconcile_deployment(self.ctx, self.state).await
            }
            Stage::Service => phases::service::reconcile_service(self.ctx, self.state).await,
            Stage::Autoscaling => {
                phases::autoscaling::reconcile_autoscaling(self.ctx, self.state).await
            }
            Stage::DeploymentStatus => {
                phases::deployment::reconcile_deployment_status(self.ctx, self.state).await
            }
        }
    }
}
