//! Machine lifecycle workflows
//!
//! - [`create`]: provision infrastructure and record it (synchronous)
//! - [`bootstrap`]: install packages and init or join the node (background)
//! - [`upgrade`]: move the node to the cluster's Kubernetes version (background)
//! - [`delete`]: drain, reset and release the machine (background)
//!
//! The synchronous halves run inside a reconcile and return the requeue
//! [`Action`](kube::runtime::controller::Action); the background halves are
//! launched through [`runner::spawn_operation`](crate::runner::spawn_operation).

pub mod bootstrap;
pub mod create;
pub mod delete;
pub mod upgrade;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::controller::Context;
use crate::crd::{FoundryMachine, MachinePhase};
use crate::events::reasons;
use crate::remote::{CommandArgs, RemoteOperation, RemoteTarget};
use crate::runner::{OperationKind, WorkflowInput};
use crate::store::{patch_machine, patch_machine_if};
use crate::Error;

pub use bootstrap::{bootstrap_machine, start_bootstrap};
pub use create::create_machine;
pub use delete::{delete_machine, start_delete};
pub use upgrade::{resume_upgrade, start_upgrade, upgrade_machine};

/// Whether the machines of a cluster allow an operation to start
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Go ahead
    Proceed,
    /// Try again later
    Wait(String),
    /// Will not become possible without intervention
    Blocked(String),
}

/// Deletion may start once no other machine is still being created
///
/// A machine that is itself being deleted does not hold up others.
pub fn deletion_readiness(machines: &[FoundryMachine], deleting: &str) -> Readiness {
    let creating = machines.iter().find(|m| {
        m.name_any() != deleting
            && !m.is_being_deleted()
            && m.phase() == Some(&MachinePhase::Provisioning)
    });
    match creating {
        Some(m) => Readiness::Wait(format!("machine {} is still provisioning", m.name_any())),
        None => Readiness::Proceed,
    }
}

/// Upgrades start only on a settled cluster
///
/// A failed machine blocks the upgrade; machines still being created or
/// deleted make it wait.
pub fn upgrade_readiness(machines: &[FoundryMachine]) -> Readiness {
    if let Some(m) = machines
        .iter()
        .find(|m| m.phase() == Some(&MachinePhase::Error))
    {
        return Readiness::Blocked(format!("machine {} is in Error", m.name_any()));
    }

    let unsettled = machines.iter().find(|m| {
        m.is_being_deleted()
            || matches!(
                m.phase(),
                None | Some(MachinePhase::Provisioning) | Some(MachinePhase::Deleting)
            )
    });
    match unsettled {
        Some(m) => Readiness::Wait(format!(
            "machine {} is {}",
            m.name_any(),
            m.phase().map(|p| p.as_str()).unwrap_or("not created yet")
        )),
        None => Readiness::Proceed,
    }
}

/// Write a new phase (plus any extra fields) and announce it
///
/// Leaving `Error` clears the recorded failure. Returns `None` if the
/// machine no longer exists.
pub async fn update_phase<F>(
    ctx: &Context,
    machine: &FoundryMachine,
    phase: MachinePhase,
    action: &str,
    mut extra: F,
) -> Result<Option<FoundryMachine>, Error>
where
    F: FnMut(&mut FoundryMachine) + Send,
{
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    let stored = patch_machine(ctx.kube.as_ref(), &namespace, &name, |m| {
        extra(m);
        set_phase(m, &phase);
    })
    .await?;

    if stored.is_some() {
        announce_phase(ctx, machine, &phase, action).await;
    }
    Ok(stored)
}

/// Write the phase a background operation ends in
///
/// The check happens on every fresh read inside the write loop: once the
/// operation's token fired or the machine was marked `Error`, nothing is
/// written and [`Error::Cancelled`] is returned. A timed-out operation never
/// overwrites the failure recorded for it.
pub async fn finish_operation<F>(
    ctx: &Context,
    input: &WorkflowInput,
    kind: OperationKind,
    phase: MachinePhase,
    mut extra: F,
) -> Result<(), Error>
where
    F: FnMut(&mut FoundryMachine) + Send,
{
    let namespace = input.namespace();
    let name = input.name();
    let cancel = &input.cancel;
    let mut superseded = false;

    let stored = patch_machine_if(ctx.kube.as_ref(), &namespace, &name, |m| {
        superseded = cancel.is_cancelled() || m.phase() == Some(&MachinePhase::Error);
        if !superseded {
            extra(m);
            set_phase(m, &phase);
        }
        !superseded
    })
    .await?;

    if superseded {
        return Err(Error::cancelled(kind.name()));
    }
    match stored {
        Some(_) => announce_phase(ctx, &input.machine, &phase, kind.event_action()).await,
        None => debug!(machine = %name, "machine vanished before the operation finished"),
    }
    Ok(())
}

fn set_phase(machine: &mut FoundryMachine, phase: &MachinePhase) {
    let status = machine.status_mut();
    status.phase = Some(phase.clone());
    if *phase != MachinePhase::Error {
        status.error_reason = None;
        status.error_message = None;
    }
}

async fn announce_phase(
    ctx: &Context,
    machine: &FoundryMachine,
    phase: &MachinePhase,
    action: &str,
) {
    let name = machine.name_any();
    info!(machine = %name, %phase, "machine phase changed");
    ctx.events
        .publish(
            &machine.object_ref(&()),
            EventType::Normal,
            reasons::RESOURCE_STATE_CHANGE,
            action,
            Some(format!("machine {name} is now {phase}")),
        )
        .await;
}

/// Run one remote operation on `target` with the workflow's token
pub(crate) async fn run_remote(
    ctx: &Context,
    input: &WorkflowInput,
    target: &RemoteTarget,
    operation: RemoteOperation,
    args: CommandArgs,
) -> Result<String, Error> {
    ctx.executor
        .run(target, operation, &args, &input.cancel)
        .await
}
