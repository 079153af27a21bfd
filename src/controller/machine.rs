//! Machine dispatch: read fresh records, pick a step, perform it

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::state::{next_step, Step};
use super::Context;
use crate::crd::{FoundryMachine, MachineErrorReason, MachinePhase};
use crate::events::{actions, reasons};
use crate::runner::machine_key;
use crate::store::patch_machine;
use crate::workflow::{create_machine, resume_upgrade, start_bootstrap, start_delete, start_upgrade};
use crate::Error;

/// Reconcile a FoundryMachine
///
/// The triggering object may be stale, so the machine and its cluster are
/// read again before deciding anything. A machine whose cluster is missing
/// is marked `Error` once and left alone.
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<FoundryMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    let key = machine_key(&namespace, &name);

    let Some(machine) = ctx.kube.get_machine(&namespace, &name).await? else {
        debug!("machine is gone");
        ctx.reset_backoff(&key);
        return Ok(Action::await_change());
    };

    let Some(cluster) = ctx
        .kube
        .get_cluster(&namespace, &machine.spec.cluster_ref)
        .await?
    else {
        record_missing_cluster(&ctx, &machine).await?;
        return Ok(Action::await_change());
    };

    let step = next_step(&machine, &cluster, ctx.operations.kind(&key))?;
    debug!(?step, phase = ?machine.phase(), "dispatching");

    let action = match step {
        Step::Create => create_machine(&ctx, &machine, &cluster).await?,
        Step::Bootstrap => start_bootstrap(&ctx, &machine, &cluster).await?,
        Step::CheckUpgrade => {
            info!(
                from = machine.kubernetes_version().unwrap_or("unknown"),
                to = %cluster.spec.kubernetes_version,
                "kubernetes version differs from cluster"
            );
            start_upgrade(&ctx, &machine, &cluster).await?
        }
        Step::ResumeUpgrade => resume_upgrade(&ctx, &machine, &cluster).await?,
        Step::Delete => start_delete(&ctx, &machine, &cluster).await?,
        Step::Idle => Action::await_change(),
    };

    ctx.reset_backoff(&key);
    Ok(action)
}

async fn record_missing_cluster(ctx: &Context, machine: &FoundryMachine) -> Result<(), Error> {
    if machine.phase() == Some(&MachinePhase::Error) {
        return Ok(());
    }

    let message = format!("cluster {} not found", machine.spec.cluster_ref);
    warn!(cluster = %machine.spec.cluster_ref, "owning cluster not found");
    patch_machine(
        ctx.kube.as_ref(),
        &machine.namespace().unwrap_or_default(),
        &machine.name_any(),
        |m| {
            let status = m.status_mut();
            status.phase = Some(MachinePhase::Error);
            status.error_reason = Some(MachineErrorReason::ResourceFailed);
            status.error_message = Some(message.clone());
        },
    )
    .await?;

    ctx.events
        .publish(
            &machine.object_ref(&()),
            EventType::Warning,
            reasons::RESOURCE_FAILED,
            actions::RECONCILE,
            Some(message),
        )
        .await;
    Ok(())
}

/// Requeue policy for failed dispatches
///
/// Waiting on a dependency polls at the dependency interval. Other
/// retryable errors back off exponentially per machine. Anything else waits
/// for the record to change.
pub fn error_policy(machine: Arc<FoundryMachine>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = machine_key(&machine.namespace().unwrap_or_default(), &machine.name_any());

    match error {
        Error::DependencyNotReady { .. } => {
            debug!(machine = %machine.name_any(), %error, "dependency not ready");
            Action::requeue(ctx.config.dependency_requeue)
        }
        e if e.is_retryable() => {
            let failures = ctx.record_failure(&key);
            let delay = ctx.config.error_backoff(failures);
            warn!(
                machine = %machine.name_any(),
                error = %e,
                failures,
                delay_secs = delay.as_secs(),
                "reconciliation failed, retrying"
            );
            Action::requeue(delay)
        }
        e => {
            error!(
                machine = %machine.name_any(),
                error = %e,
                "reconciliation failed, waiting for a change"
            );
            Action::await_change()
        }
    }
}
