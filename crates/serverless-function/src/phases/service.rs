//! Service stage

use kube::ResourceExt;
use tracing::{info, warn};

use serverless_common::crd::{ConditionReason, ConditionStatus};
use serverless_common::Error;

use super::deployment::running_condition;
use super::set_condition;
use crate::controller::Context;
use crate::diff::equal_services;
use crate::fsm::{Outcome, StageResult};
use crate::resources::service::build_service;
use crate::snapshot::SystemState;

/// Keep the Service named after the Function routing to its pods
pub async fn reconcile_service(ctx: &Context, state: &mut SystemState) -> Result<StageResult, Error> {
    let expected = build_service(state);

    let existing = match state.services.as_slice() {
        [] => {
            let created = ctx.kube.create_service(&expected).await?;
            info!(function = %state.name, service = %created.name_any(), "created service");
            set_condition(
                ctx,
                state,
                running_condition(
                    ConditionStatus::Unknown,
                    ConditionReason::ServiceCreated,
                    format!("Service {} created", created.name_any()),
                ),
            )
            .await?;
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
        [service] => service,
        duplicates => {
            warn!(function = %state.name, count = duplicates.len(), "multiple services, keeping the one named after the function");
            for service in duplicates.iter().filter(|s| s.name_any() != state.name) {
                ctx.kube
                    .delete_service(&state.namespace, &service.name_any())
                    .await?;
            }
            return Ok(StageResult::Finish(Outcome::AwaitChange));
        }
    };

    if equal_services(existing, &expected) {
        return Ok(StageResult::Continue);
    }

    // Copy of the live object so immutable fields such as clusterIP stay untouched
    let mut updated = existing.clone();
    updated.metadata.labels = expected.metadata.labels.clone();
    if let (Some(spec), Some(want)) = (updated.spec.as_mut(), expected.spec) {
        spec.type_ = want.type_;
        spec.selector = want.selector;
        spec.ports = want.ports;
    }
    ctx.kube.update_service(&updated).await?;
    info!(function = %state.name, service = %updated.name_any(), "updated service");
    set_condition(
        ctx,
        state,
        running_condition(
            ConditionStatus::Unknown,
            ConditionReason::ServiceUpdated,
            format!("Service {} updated", updated.name_any()),
        ),
    )
    .await?;
    Ok(StageResult::Finish(Outcome::AwaitChange))
}
