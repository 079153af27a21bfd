//! Delete workflow: drain the node, reset it and release the machine
//!
//! The finalizer comes off only after the provisioner released the machine,
//! so a failed teardown keeps the record around and is retried.

use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::{deletion_readiness, run_remote, update_phase, Readiness};
use crate::controller::Context;
use crate::crd::{FoundryCluster, FoundryMachine, MachinePhase};
use crate::error::LookupFailure;
use crate::events::{actions, reasons};
use crate::remote::{args, CommandArgs, RemoteOperation, RemoteTarget};
use crate::runner::{
    ensure_active, machine_key, prepare_operation, spawn_operation, OperationKind, WorkflowInput,
};
use crate::store::patch_machine;
use crate::Error;

/// Start tearing down a machine marked for deletion
///
/// Waits while another machine of the cluster is still being created or
/// while the machine's own operation is still winding down. A machine whose
/// previous teardown failed is retried once its last status write is older
/// than the retry backoff.
#[instrument(skip(ctx, machine, cluster), fields(machine = %machine.name_any()))]
pub async fn start_delete(
    ctx: &Arc<Context>,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
) -> Result<Action, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    if let Some(kind) = ctx.operations.kind(&machine_key(&namespace, &name)) {
        debug!(operation = %kind, "operation in flight, teardown waits for it");
        return Ok(Action::requeue(ctx.config.dependency_requeue));
    }
    if !machine.has_finalizer() {
        debug!("no cleanup finalizer, nothing to tear down");
        return Ok(Action::await_change());
    }

    if machine.phase() == Some(&MachinePhase::Error) {
        let last_updated = machine.status.as_ref().and_then(|s| s.last_updated);
        if let Some(since) = last_updated.and_then(|t| (Utc::now() - t).to_std().ok()) {
            if since < ctx.config.delete_retry_backoff {
                return Ok(Action::requeue(ctx.config.delete_retry_backoff - since));
            }
        }
        info!("retrying teardown of failed machine");
    }

    let machines = ctx.kube.list_machines(&namespace).await?;
    if let Readiness::Wait(reason) = deletion_readiness(&machines, &name) {
        debug!(%reason, "deletion waiting on cluster");
        return Ok(Action::requeue(ctx.config.dependency_requeue));
    }

    let mut input = prepare_operation(ctx, machine, cluster).await?;
    let Some(deleting) =
        update_phase(ctx, machine, MachinePhase::Deleting, actions::DELETE, |_| {}).await?
    else {
        return Ok(Action::await_change());
    };
    input.machine = deleting;

    if spawn_operation(ctx, OperationKind::Delete, input, |ctx, input| {
        delete_machine(ctx, input).boxed()
    })
    .is_some()
    {
        info!("teardown launched");
    }
    Ok(Action::await_change())
}

/// Drain and reset the node, release the machine, drop the finalizer
///
/// A machine that never got a provisioner identifier was never handed out,
/// so there is no node to drain or reset and nothing to release. Nodes of a
/// stopping cluster are not drained; the cluster goes away as a whole.
/// Resetting the node is best effort.
#[instrument(skip(ctx, input), fields(machine = %input.name()))]
pub async fn delete_machine(ctx: Arc<Context>, input: WorkflowInput) -> Result<(), Error> {
    match input.machine.provisioner_id() {
        Some(system_id) => {
            teardown_node(&ctx, &input).await?;
            ctx.provisioner.delete(system_id, &input.cancel).await?;
            info!(%system_id, "machine released");
        }
        None => info!("no provisioner identifier recorded, skipping drain and release"),
    }

    ensure_active(&input.cancel, OperationKind::Delete.name())?;
    patch_machine(ctx.kube.as_ref(), &input.namespace(), &input.name(), |m| {
        m.remove_finalizer();
    })
    .await?;
    info!("teardown finished");
    Ok(())
}

async fn teardown_node(ctx: &Context, input: &WorkflowInput) -> Result<(), Error> {
    let Ok(target) = RemoteTarget::for_machine(&input.machine, &input.private_key) else {
        debug!("machine has no address, skipping drain");
        return Ok(());
    };

    if input.cluster.is_stopping() {
        debug!("cluster is stopping, skipping drain");
    } else {
        drain(ctx, input, &target).await?;
    }

    match run_remote(ctx, input, &target, RemoteOperation::DeleteNode, CommandArgs::new()).await {
        Ok(_) => Ok(()),
        Err(e @ Error::Cancelled { .. }) => Err(e),
        Err(e) => {
            warn!(error = %e, "node reset failed, releasing anyway");
            Ok(())
        }
    }
}

async fn drain(ctx: &Context, input: &WorkflowInput, target: &RemoteTarget) -> Result<(), Error> {
    let name = input.name();
    let control_plane = match ctx.kube.find_control_plane(&input.namespace()).await {
        Ok(cp) => cp,
        Err(Error::ControlPlaneLookup {
            failure: LookupFailure::NotFound,
            ..
        }) => {
            warn!("no control plane left, skipping drain");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if control_plane.name_any() == name {
        warn!("deleting the control plane of a running cluster");
        ctx.events
            .publish(
                &input.machine.object_ref(&()),
                EventType::Warning,
                reasons::CONTROL_PLANE_DELETION,
                actions::DELETE,
                Some(format!(
                    "control plane {name} is being deleted while its cluster is not stopping"
                )),
            )
            .await;
    }

    let cp_target = match RemoteTarget::for_machine(&control_plane, &input.private_key) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "control plane unreachable, skipping drain");
            return Ok(());
        }
    };

    let admin_conf = run_remote(
        ctx,
        input,
        &cp_target,
        RemoteOperation::FetchAdminKubeconfig,
        CommandArgs::new(),
    )
    .await?;
    run_remote(
        ctx,
        input,
        target,
        RemoteOperation::DrainAndDeleteNode,
        CommandArgs::from([(args::ADMIN_CONF.to_string(), admin_conf)]),
    )
    .await?;
    debug!("node drained");
    Ok(())
}
