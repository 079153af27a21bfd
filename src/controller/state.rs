//! Machine phase state machine
//!
//! Decides, from the freshly read machine and cluster, which step a dispatch
//! takes. The decision is pure; [`super::reconcile`] carries it out.
//!
//! ```text
//!  (unset) --create--> Provisioning --bootstrap--> Ready
//!                                                   |  ^
//!                          version differs: upgrade |  | upgraded
//!                                                   v  |
//!                                                 Upgrading
//!
//!  any phase --deletion requested--> Deleting --> (finalizer removed)
//!  any workflow failure or timeout --> Error
//! ```

use kube::ResourceExt;

use crate::crd::{FoundryCluster, FoundryMachine, MachinePhase};
use crate::runner::OperationKind;
use crate::Error;

/// What a dispatch does for a machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Provision infrastructure
    Create,
    /// Launch the bootstrap workflow
    Bootstrap,
    /// Start an upgrade if the cluster allows it
    CheckUpgrade,
    /// Relaunch an upgrade interrupted by a restart
    ResumeUpgrade,
    /// Start or retry teardown
    Delete,
    /// Nothing to do until something changes
    Idle,
}

/// Pick the next step for `machine`
///
/// `in_flight` is the background operation already running for the machine,
/// if any. Deletion wins over every phase. An unrecognized phase is an error
/// that needs a human.
pub fn next_step(
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
    in_flight: Option<OperationKind>,
) -> Result<Step, Error> {
    if machine.is_being_deleted() {
        return Ok(Step::Delete);
    }

    let Some(phase) = machine.phase() else {
        return Ok(Step::Create);
    };

    let step = match phase {
        MachinePhase::Provisioning if in_flight.is_some() => Step::Idle,
        MachinePhase::Provisioning => Step::Bootstrap,
        MachinePhase::Ready
            if in_flight.is_some()
                || machine.kubernetes_version() == Some(cluster.spec.kubernetes_version.as_str()) =>
        {
            Step::Idle
        }
        MachinePhase::Ready => Step::CheckUpgrade,
        MachinePhase::Upgrading if in_flight.is_some() => Step::Idle,
        MachinePhase::Upgrading => Step::ResumeUpgrade,
        MachinePhase::Deleting => Step::Delete,
        MachinePhase::Error => Step::Idle,
        MachinePhase::Unrecognized(raw) => {
            return Err(Error::unknown_phase(machine.name_any(), raw.as_str()))
        }
    };
    Ok(step)
}
