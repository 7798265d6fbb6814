//! Stage handlers for the Function reconciler
//!
//! Each handler inspects one kind of owned object in the snapshot, issues at
//! most one corrective write and reports whether the pass may go on.

pub mod autoscaling;
pub mod build;
pub mod deployment;
pub mod service;
pub mod source;

use kube::Resource;
use tracing::{debug, info};

use serverless_common::crd::{equal_conditions, update_condition, Condition, FunctionStatus};
use serverless_common::events::publish_condition;
use serverless_common::Error;

use crate::controller::Context;
use crate::snapshot::SystemState;

/// Write `condition` and the fields set by `mutate` to the Function status.
///
/// Nothing is written when conditions (ignoring timestamps) and the other
/// status fields are unchanged. A write is followed by an Event and a stats
/// update.
pub(crate) async fn update_status<F>(
    ctx: &Context,
    state: &mut SystemState,
    condition: Condition,
    mutate: F,
) -> Result<(), Error>
where
    F: FnOnce(&mut FunctionStatus) + Send,
{
    let mut status = state.status.clone();
    status.conditions = update_condition(&state.status.conditions, condition.clone());
    mutate(&mut status);

    if equal_conditions(&state.status.conditions, &status.conditions)
        && same_source_fields(&state.status, &status)
    {
        debug!(
            function = %state.name,
            condition = %condition.type_,
            "status unchanged, skipping write"
        );
        return Ok(());
    }

    ctx.kube
        .patch_function_status(&state.namespace, &state.name, &status)
        .await?;
    state.status = status;

    info!(
        function = %state.name,
        condition = %condition.type_,
        status = %condition.status,
        reason = %condition.reason,
        "condition updated"
    );
    publish_condition(ctx.events.as_ref(), &state.function.object_ref(&()), &condition).await;
    ctx.stats.update_reconcile_stats(&state.function, &condition);
    Ok(())
}

/// Write `condition` only
pub(crate) async fn set_condition(
    ctx: &Context,
    state: &mut SystemState,
    condition: Condition,
) -> Result<(), Error> {
    update_status(ctx, state, condition, |_| {}).await
}

fn same_source_fields(a: &FunctionStatus, b: &FunctionStatus) -> bool {
    a.commit == b.commit
        && a.reference == b.reference
        && a.base_dir == b.base_dir
        && a.runtime == b.runtime
        && a.runtime_image_override == b.runtime_image_override
        && a.image_tag == b.image_tag
}
