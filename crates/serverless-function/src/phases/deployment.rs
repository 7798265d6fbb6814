//! Deployment stage and rollout status evaluation

use kube::ResourceExt;
use tracing::{info, warn};

use serverless_common::crd::{
    Condition, ConditionReason, ConditionStatus, ConditionType, SourceType,
};
use serverless_common::Error;

use super::set_condition;
use crate::controller::Context;
use crate::diff::equal_deployments;
use crate::fsm::{Outcome, StageResult};
use crate::resources::deployment::build_deployment;
use crate::snapshot::{DeploymentReadiness, SystemState};

pub(crate) fn running_condition(
    status: ConditionStatus,
    reason: ConditionReason,
    message: String,
) -> Condition {
    Condition::new(ConditionType::Running, status, reason, message)
}

/// Keep exactly one Deployment running the built image
pub async fn reconcile_deployment(
    ctx: &Context,
    state: &mut SystemState,
) -> Result<StageResult, Error> {
    let expected = build_deployment(state, &ctx.config);
    let scaling = state.function.spec.scaling_enabled();

    let existing = match state.deployments.as_slice() {
        [] => {
            let created = ctx.kube.create_deployment(&expected).await?;
            info!(function = %state.name, deployment = %created.name_any(), "created deployment");
            set_condition(
                ctx,
                state,
                running_condition(
                    ConditionStatus::Unknown,
                    ConditionReason::DeploymentCreated,
                    format!("Deployment {} created", created.name_any()),
                ),
            )
            .await?;
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
        [deployment] => deployment,
        duplicates => {
            warn!(function = %state.name, count = duplicates.len(), "multiple deployments, deleting all");
            ctx.kube
                .delete_all_deployments(&state.namespace, &state.internal_labels())
                .await?;
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
    };

    if equal_deployments(existing, &expected, scaling) {
        return Ok(StageResult::Continue);
    }

    let mut updated = existing.clone();
    updated.metadata.labels = expected.metadata.labels.clone();
    if let (Some(spec), Some(want)) = (updated.spec.as_mut(), expected.spec) {
        spec.template = want.template;
        // The autoscaler owns the replica count while it is active
        if !scaling {
            spec.replicas = want.replicas;
        }
    }
    ctx.kube.update_deployment(&updated).await?;
    info!(function = %state.name, deployment = %updated.name_any(), "updated deployment");
    set_condition(
        ctx,
        state,
        running_condition(
            ConditionStatus::Unknown,
            ConditionReason::DeploymentUpdated,
            format!("Deployment {} updated", updated.name_any()),
        ),
    )
    .await?;
    Ok(StageResult::Finish(Outcome::AwaitChange))
}

/// Translate the rollout state into the Running condition
pub async fn reconcile_deployment_status(
    ctx: &Context,
    state: &mut SystemState,
) -> Result<StageResult, Error> {
    let name = state
        .deployments
        .first()
        .map(|d| d.name_any())
        .unwrap_or_default();

    let (condition, outcome) = match state.deployment_readiness() {
        DeploymentReadiness::Ready => {
            let requeue = &ctx.config.requeue;
            let after = match state.function.spec.source_type() {
                SourceType::Inline => requeue.function_ready,
                SourceType::Git => requeue.function_ready.min(requeue.git_fetch),
            };
            (
                running_condition(
                    ConditionStatus::True,
                    ConditionReason::DeploymentReady,
                    format!("Deployment {name} is ready"),
                ),
                Outcome::Requeue(after),
            )
        }
        DeploymentReadiness::Degraded => (
            running_condition(
                ConditionStatus::Unknown,
                ConditionReason::MinReplicasNotAvailable,
                format!("Minimum replicas not available for deployment {name}"),
            ),
            Outcome::AwaitChange,
        ),
        DeploymentReadiness::Progressing => (
            running_condition(
                ConditionStatus::Unknown,
                ConditionReason::DeploymentWaiting,
                format!("Deployment {name} is not ready yet"),
            ),
            Outcome::AwaitChange,
        ),
        DeploymentReadiness::Failed => {
            let conditions = state.deployment_conditions_json();
            warn!(function = %state.name, deployment = %name, %conditions, "deployment failed");
            (
                running_condition(
                    ConditionStatus::False,
                    ConditionReason::DeploymentFailed,
                    format!("Deployment {name} failed with condition: {conditions}"),
                ),
                Outcome::AwaitChange,
            )
        }
    };

    set_condition(ctx, state, condition).await?;
    Ok(StageResult::Finish(outcome))
}
