//! Source stage: inline ConfigMap or resolved git revision

use kube::ResourceExt;
use tracing::{info, warn};

use serverless_common::crd::{
    Condition, ConditionReason, ConditionStatus, ConditionType, SourceType,
};
use serverless_common::Error;

use super::{set_condition, update_status};
use crate::controller::Context;
use crate::fsm::{Outcome, StageResult};
use crate::resources::configmap::build_config_map;
use crate::snapshot::SystemState;
use crate::source::{next_requeue, read_git_options};

/// Bring the sources up to date
pub async fn reconcile_source(ctx: &Context, state: &mut SystemState) -> Result<StageResult, Error> {
    match state.function.spec.source_type() {
        SourceType::Inline => reconcile_inline(ctx, state).await,
        SourceType::Git => reconcile_git(ctx, state).await,
    }
}

fn configured(reason: ConditionReason, message: String) -> Condition {
    Condition::new(
        ConditionType::ConfigurationReady,
        ConditionStatus::True,
        reason,
        message,
    )
}

fn source_failed(message: String) -> Condition {
    Condition::new(
        ConditionType::ConfigurationReady,
        ConditionStatus::False,
        ConditionReason::SourceUpdateFailed,
        message,
    )
}

async fn reconcile_inline(ctx: &Context, state: &mut SystemState) -> Result<StageResult, Error> {
    if !state.inline_source_changed() {
        return Ok(StageResult::Continue);
    }

    let expected = build_config_map(state);
    let image_tag = state.image_tag();
    let condition = match state.config_maps.as_slice() {
        [] => {
            let created = ctx.kube.create_config_map(&expected).await?;
            info!(function = %state.name, config_map = %created.name_any(), "created sources ConfigMap");
            configured(
                ConditionReason::ConfigMapCreated,
                format!("ConfigMap {} created", created.name_any()),
            )
        }
        [existing] => {
            let mut updated = existing.clone();
            updated.data = expected.data;
            updated.metadata.labels = expected.metadata.labels;
            ctx.kube.update_config_map(&updated).await?;
            info!(function = %state.name, config_map = %updated.name_any(), "updated sources ConfigMap");
            configured(
                ConditionReason::ConfigMapUpdated,
                format!("ConfigMap {} updated", updated.name_any()),
            )
        }
        duplicates => {
            warn!(
                function = %state.name,
                count = duplicates.len(),
                "multiple sources ConfigMaps, deleting all"
            );
            ctx.kube
                .delete_all_config_maps(&state.namespace, &state.internal_labels())
                .await?;
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
    };

    update_status(ctx, state, condition, |status| {
        status.image_tag = Some(image_tag);
    })
    .await?;
    Ok(StageResult::Finish(Outcome::AwaitChange))
}

async fn reconcile_git(ctx: &Context, state: &mut SystemState) -> Result<StageResult, Error> {
    let options = match read_git_options(ctx.kube.as_ref(), &state.function, &state.namespace).await
    {
        Ok(options) => options,
        Err(e @ Error::Kube { .. }) => return Err(e),
        Err(e) => {
            warn!(function = %state.name, error = %e, "reading git options failed");
            set_condition(ctx, state, source_failed(format!("Reading git options failed: {e}")))
                .await?;
            return Ok(StageResult::Finish(Outcome::Requeue(
                ctx.config.requeue.source_error,
            )));
        }
    };

    let commit = match ctx.resolver.last_commit(&options).await {
        Ok(commit) => commit,
        Err(e) => {
            let (after, message) = next_requeue(&e, &ctx.config.requeue);
            warn!(function = %state.name, error = %e, requeue_after = ?after, "resolving git reference failed");
            set_condition(ctx, state, source_failed(message)).await?;
            return Ok(StageResult::Finish(Outcome::Requeue(after)));
        }
    };

    let confirmed = state.status.condition(ConditionType::ConfigurationReady) == ConditionStatus::True;
    if !state.git_source_changed(&commit) && confirmed {
        return Ok(StageResult::Continue);
    }

    let spec = state.function.spec.clone();
    let (reference, base_dir) = spec
        .source
        .git_repository
        .as_ref()
        .map(|g| (g.reference.clone(), g.base_dir.clone()))
        .unwrap_or_default();
    let image_tag = state.git_image_tag(&commit, &base_dir);
    info!(function = %state.name, %commit, %reference, "git sources updated");

    let message = format!("Sources {} updated", state.name);
    update_status(
        ctx,
        state,
        configured(ConditionReason::SourceUpdated, message),
        |status| {
            status.commit = Some(commit);
            status.reference = Some(reference);
            status.base_dir = Some(base_dir);
            status.runtime = Some(spec.runtime);
            status.runtime_image_override = spec.runtime_image_override;
            status.image_tag = Some(image_tag);
        },
    )
    .await?;
    Ok(StageResult::Finish(Outcome::AwaitChange))
}
