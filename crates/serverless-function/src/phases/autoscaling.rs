//! Autoscaling stage

use kube::ResourceExt;
use tracing::{info, warn};

use serverless_common::crd::{ConditionReason, ConditionStatus};
use serverless_common::Error;

use super::deployment::running_condition;
use super::set_condition;
use crate::controller::Context;
use crate::diff::equal_hpas;
use crate::fsm::{Outcome, StageResult};
use crate::resources::hpa::build_hpa;
use crate::snapshot::SystemState;

/// Keep an autoscaler only while the replica bounds differ
pub async fn reconcile_autoscaling(
    ctx: &Context,
    state: &mut SystemState,
) -> Result<StageResult, Error> {
    if !state.function.spec.scaling_enabled() {
        if state.hpas.is_empty() {
            return Ok(StageResult::Continue);
        }
        info!(function = %state.name, "scaling disabled, deleting autoscalers");
        ctx.kube
            .delete_all_hpas(&state.namespace, &state.internal_labels())
            .await?;
        return Ok(StageResult::Finish(Outcome::AwaitChange));
    }

    let Some(deployment_name) = state.deployments.first().map(|d| d.name_any()) else {
        return Err(Error::internal_with_context(
            "autoscaling",
            "no deployment to scale",
        ));
    };
    let expected = build_hpa(state, &ctx.config, &deployment_name);

    let existing = match state.hpas.as_slice() {
        [] => {
            let created = ctx.kube.create_hpa(&expected).await?;
            info!(function = %state.name, hpa = %created.name_any(), "created autoscaler");
            set_condition(
                ctx,
                state,
                running_condition(
                    ConditionStatus::Unknown,
                    ConditionReason::HorizontalPodAutoscalerCreated,
                    format!("HorizontalPodAutoscaler {} created", created.name_any()),
                ),
            )
            .await?;
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
        [hpa] => hpa,
        duplicates => {
            warn!(function = %state.name, count = duplicates.len(), "multiple autoscalers, deleting all");
            ctx.kube
                .delete_all_hpas(&state.namespace, &state.internal_labels())
                .await?;
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
    };

    if equal_hpas(existing, &expected) {
        return Ok(StageResult::Continue);
    }

    let mut updated = existing.clone();
    updated.metadata.labels = expected.metadata.labels.clone();
    updated.spec = expected.spec;
    ctx.kube.update_hpa(&updated).await?;
    info!(function = %state.name, hpa = %updated.name_any(), "updated autoscaler");
    set_condition(
        ctx,
        state,
        running_condition(
            ConditionStatus::Unknown,
            ConditionReason::HorizontalPodAutoscalerUpdated,
            format!("HorizontalPodAutoscaler {} updated", updated.name_any()),
        ),
    )
    .await?;
    Ok(StageResult::Finish(Outcome::AwaitChange))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::deployment::reconcile_deployment;
    use crate::snapshot::tests::inline_function;
    use crate::testing::{ctx_with, FakeCluster};
    use serverless_common::crd::{Function, ScaleConfig};
    use std::sync::Arc;

    fn scaled(min: i32, max: i32) -> Function {
        let mut function = inline_function("hello");
        function.spec.scale_config = Some(ScaleConfig {
            min_replicas: Some(min),
            max_replicas: Some(max),
        });
        function
    }

    async fn deployed(function: Function) -> (Arc<FakeCluster>, Context) {
        let cluster = Arc::new(FakeCluster::with_function(function));
        let ctx = ctx_with(cluster.clone());
        let mut state = cluster.snapshot().await;
        reconcile_deployment(&ctx, &mut state).await.unwrap();
        (cluster, ctx)
    }

    #[tokio::test]
    async fn equal_bounds_never_create_autoscaler() {
        let (cluster, ctx) = deployed(scaled(2, 2)).await;
        let mut state = cluster.snapshot().await;
        assert_eq!(
            reconcile_autoscaling(&ctx, &mut state).await.unwrap(),
            StageResult::Continue
        );
        assert!(cluster.hpas().is_empty());
    }

    #[tokio::test]
    async fn autoscaler_targets_the_deployment() {
        let (cluster, ctx) = deployed(scaled(1, 3)).await;
        let mut state = cluster.snapshot().await;
        reconcile_autoscaling(&ctx, &mut state).await.unwrap();

        let hpas = cluster.hpas();
        assert_eq!(hpas.len(), 1);
        let spec = hpas[0].spec.as_ref().unwrap();
        assert_eq!(
            spec.scale_target_ref.name,
            cluster.deployments()[0].name_any()
        );
        assert_eq!(spec.max_replicas, 3);

        let mut state = cluster.snapshot().await;
        assert_eq!(
            reconcile_autoscaling(&ctx, &mut state).await.unwrap(),
            StageResult::Continue
        );
    }

    #[tokio::test]
    async fn bound_change_updates_autoscaler() {
        let (cluster, ctx) = deployed(scaled(1, 3)).await;
        let mut state = cluster.snapshot().await;
        reconcile_autoscaling(&ctx, &mut state).await.unwrap();

        cluster.edit_function(|f| f.spec.scale_config.as_mut().unwrap().max_replicas = Some(8));
        let mut state = cluster.snapshot().await;
        reconcile_autoscaling(&ctx, &mut state).await.unwrap();
        assert_eq!(cluster.hpas()[0].spec.as_ref().unwrap().max_replicas, 8);
        assert_eq!(
            state.status.conditions[0].reason,
            ConditionReason::HorizontalPodAutoscalerUpdated
        );
    }

    #[tokio::test]
    async fn duplicate_hpas_are_all_deleted() {
        let (cluster, ctx) = deployed(scaled(1, 3)).await;
        let state = cluster.snapshot().await;
        let hpa = build_hpa(&state, &ctx.config, &cluster.deployments()[0].name_any());
        cluster.insert_hpa(hpa.clone());
        cluster.insert_hpa(hpa);

        let mut state = cluster.snapshot().await;
        assert_eq!(
            reconcile_autoscaling(&ctx, &mut state).await.unwrap(),
            StageResult::Finish(Outcome::AwaitChange)
        );
        assert!(cluster.hpas().is_empty());

        let mut state = cluster.snapshot().await;
        reconcile_autoscaling(&ctx, &mut state).await.unwrap();
        assert_eq!(cluster.hpas().len(), 1);
        assert_eq!(
            state.status.conditions[0].reason,
            ConditionReason::HorizontalPodAutoscalerCreated
        );
    }

    #[tokio::test]
    async fn disabling_scaling_removes_autoscaler() {
        let (cluster, ctx) = deployed(scaled(1, 3)).await;
        let mut state = cluster.snapshot().await;
        reconcile_autoscaling(&ctx, &mut state).await.unwrap();

        cluster.edit_function(|f| f.spec.scale_config.as_mut().unwrap().max_replicas = Some(1));
        let mut state = cluster.snapshot().await;
        reconcile_autoscaling(&ctx, &mut state).await.unwrap();
        assert!(cluster.hpas().is_empty());
    }
}
