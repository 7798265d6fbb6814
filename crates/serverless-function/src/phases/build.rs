//! Build stage: one image build Job per source revision

use kube::ResourceExt;
use tracing::{info, warn};

use serverless_common::crd::{Condition, ConditionReason, ConditionStatus, ConditionType};
use serverless_common::Error;

use super::set_condition;
use crate::controller::Context;
use crate::diff::{equal_jobs, job_labels_equal};
use crate::fsm::{Outcome, StageResult};
use crate::resources::job::{build_job, job_failed, job_failure_message, job_succeeded};
use crate::snapshot::SystemState;

const BACKOFF_LIMIT_EXCEEDED: &str = "BackoffLimitExceeded";

fn build_condition(status: ConditionStatus, reason: ConditionReason, message: String) -> Condition {
    Condition::new(ConditionType::BuildReady, status, reason, message)
}

/// Make sure the image for the current sources is built
pub async fn reconcile_build(ctx: &Context, state: &mut SystemState) -> Result<StageResult, Error> {
    let expected = build_job(state, &ctx.config)?;

    let existing = match state.jobs.as_slice() {
        [] => return create_job(ctx, state, &expected).await,
        [job] => job.clone(),
        duplicates => {
            warn!(function = %state.name, count = duplicates.len(), "multiple build jobs, deleting all");
            ctx.kube
                .delete_all_jobs(&state.namespace, &state.internal_labels())
                .await?;
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
    };
    let job_name = existing.name_any();

    if !equal_jobs(&existing, &expected) {
        info!(function = %state.name, job = %job_name, "build job is for stale sources, deleting");
        ctx.kube
            .delete_all_jobs(&state.namespace, &state.internal_labels())
            .await?;
        set_condition(
            ctx,
            state,
            build_condition(
                ConditionStatus::Unknown,
                ConditionReason::JobsDeleted,
                format!("Job {job_name} deleted"),
            ),
        )
        .await?;
        return Ok(StageResult::Finish(Outcome::AwaitChange));
    }

    if !job_labels_equal(&existing, &expected) {
        let mut updated = existing.clone();
        updated.metadata.labels = expected.metadata.labels.clone();
        ctx.kube.update_job(&updated).await?;
        set_condition(
            ctx,
            state,
            build_condition(
                ConditionStatus::Unknown,
                ConditionReason::JobUpdated,
                format!("Job {job_name} updated"),
            ),
        )
        .await?;
        return Ok(StageResult::Finish(Outcome::AwaitChange));
    }

    let current = state.status.condition(ConditionType::BuildReady);

    if job_failed(&existing, |reason| reason == BACKOFF_LIMIT_EXCEEDED)
        && current == ConditionStatus::False
    {
        info!(function = %state.name, job = %job_name, "deleting failed build job to retry");
        ctx.kube
            .delete_all_jobs(&state.namespace, &state.internal_labels())
            .await?;
        return Ok(StageResult::Finish(Outcome::AwaitChange));
    }

    if job_failed(&existing, |_| true) {
        let detail = job_failure_message(&existing).unwrap_or_default();
        warn!(function = %state.name, job = %job_name, %detail, "build job failed");
        set_condition(
            ctx,
            state,
            build_condition(
                ConditionStatus::False,
                ConditionReason::JobFailed,
                format!("Job {job_name} failed: {detail}"),
            ),
        )
        .await?;
        return Ok(StageResult::Finish(Outcome::Requeue(
            ctx.config.requeue.build_failed,
        )));
    }

    if job_succeeded(&existing) {
        if current == ConditionStatus::True {
            return Ok(StageResult::Continue);
        }
        set_condition(
            ctx,
            state,
            build_condition(
                ConditionStatus::True,
                ConditionReason::JobFinished,
                format!("Job {job_name} finished"),
            ),
        )
        .await?;
        return Ok(StageResult::Finish(Outcome::AwaitChange));
    }

    set_condition(
        ctx,
        state,
        build_condition(
            ConditionStatus::Unknown,
            ConditionReason::JobRunning,
            format!("Job {job_name} is still in progress"),
        ),
    )
    .await?;
    Ok(StageResult::Finish(Outcome::AwaitChange))
}

async fn create_job(
    ctx: &Context,
    state: &mut SystemState,
    expected: &k8s_openapi::api::batch::v1::Job,
) -> Result<StageResult, Error> {
    if !ctx.gate.admit(ctx.kube.as_ref()).await? {
        info!(function = %state.name, "build queue is full, waiting");
        return Ok(StageResult::Finish(Outcome::Requeue(
            ctx.config.requeue.build_queue_full,
        )));
    }

    let created = ctx.kube.create_job(expected).await?;
    info!(function = %state.name, job = %created.name_any(), "created build job");
    set_condition(
        ctx,
        state,
        build_condition(
            ConditionStatus::Unknown,
            ConditionReason::JobCreated,
            format!("Job {} created", created.name_any()),
        ),
    )
    .await?;
    Ok(StageResult::Finish(Outcome::AwaitChange))
}
