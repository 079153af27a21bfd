//! Background operation runner
//!
//! Bootstrap, upgrade and teardown take minutes, far longer than a reconcile
//! may block. The reconciler hands them to [`spawn_operation`], which runs
//! the workflow on its own task and supervises it:
//!
//! - a failed workflow marks the machine `Error` with the failure reason;
//! - a workflow that outlives [`ReconcilerConfig::operation_timeout`] has the
//!   machine marked `Error` (`OperationTimedOut`) and its cancellation token
//!   cancelled. Its late outcome is awaited and logged, and a late success
//!   never reverts the `Error` phase: workflows check their token before the
//!   terminal status write.
//!
//! At most one operation runs per machine; the [`OperationRegistry`] tracks
//! them so a dispatch that finds one in flight does not start another.
//!
//! [`ReconcilerConfig::operation_timeout`]: crate::config::ReconcilerConfig::operation_timeout

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::controller::Context;
use crate::crd::{FoundryCluster, FoundryMachine, MachineErrorReason, MachinePhase};
use crate::events::{actions, reasons};
use crate::remote::PrivateKey;
use crate::store::{patch_machine, KubeClient};
use crate::{Error, PRIVATE_KEY_SECRET_KEY};

/// Kind of background operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Install packages and init or join the node
    Bootstrap,
    /// Upgrade the node's Kubernetes version
    Upgrade,
    /// Drain, reset and release the machine
    Delete,
}

impl OperationKind {
    /// Stable name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Upgrade => "upgrade",
            Self::Delete => "delete",
        }
    }

    /// Action recorded on the events of this operation
    pub fn event_action(&self) -> &'static str {
        match self {
            Self::Bootstrap => actions::BOOTSTRAP,
            Self::Upgrade => actions::UPGRADE,
            Self::Delete => actions::DELETE,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry key of a machine
pub fn machine_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Operations currently in flight, keyed by machine
#[derive(Default)]
pub struct OperationRegistry {
    running: DashMap<String, OperationKind>,
}

impl OperationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind of the operation running for `key`, if any
    pub fn kind(&self, key: &str) -> Option<OperationKind> {
        self.running.get(key).map(|op| *op)
    }

    /// True while an operation runs for `key`
    pub fn is_running(&self, key: &str) -> bool {
        self.running.contains_key(key)
    }

    /// Number of operations in flight
    pub fn len(&self) -> usize {
        self.running.len()
    }

    /// True when nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    fn try_register(&self, key: &str, kind: OperationKind) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.running.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(kind);
                true
            }
        }
    }

    fn remove(&self, key: &str) {
        self.running.remove(key);
    }
}

/// Everything a workflow gets bound to
#[derive(Clone, Debug)]
pub struct WorkflowInput {
    /// The machine as of launch
    pub machine: FoundryMachine,
    /// Its cluster as of launch
    pub cluster: FoundryCluster,
    /// Key for remote execution
    pub private_key: PrivateKey,
    /// Fires on timeout or shutdown
    pub cancel: CancellationToken,
}

impl WorkflowInput {
    /// Namespace of the machine
    pub fn namespace(&self) -> String {
        self.machine.namespace().unwrap_or_default()
    }

    /// Name of the machine
    pub fn name(&self) -> String {
        self.machine.name_any()
    }
}

/// Read the cluster's SSH private key
pub async fn load_private_key(
    kube: &dyn KubeClient,
    cluster: &FoundryCluster,
) -> Result<PrivateKey, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let secret = kube
        .get_secret(&namespace, &cluster.spec.secret)
        .await?
        .ok_or_else(|| {
            Error::dependency_not_ready(
                &cluster_name,
                format!("secret {} not found", cluster.spec.secret),
            )
        })?;

    secret
        .data
        .and_then(|mut data| data.remove(PRIVATE_KEY_SECRET_KEY))
        .filter(|key| !key.0.is_empty())
        .map(|key| PrivateKey::new(key.0))
        .ok_or_else(|| {
            Error::dependency_not_ready(
                &cluster_name,
                format!(
                    "secret {} has no {PRIVATE_KEY_SECRET_KEY} entry",
                    cluster.spec.secret
                ),
            )
        })
}

/// Bind a machine and cluster to a fresh workflow input
///
/// Fetches the private key before anything else so a missing key fails the
/// dispatch before a phase is written.
pub async fn prepare_operation(
    ctx: &Context,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
) -> Result<WorkflowInput, Error> {
    let private_key = load_private_key(ctx.kube.as_ref(), cluster).await?;
    Ok(WorkflowInput {
        machine: machine.clone(),
        cluster: cluster.clone(),
        private_key,
        cancel: ctx.shutdown.child_token(),
    })
}

/// Fail with [`Error::Cancelled`] once the token fired
pub fn ensure_active(cancel: &CancellationToken, operation: &str) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled(operation));
    }
    Ok(())
}

/// Future of a launched workflow
pub type WorkflowFuture = BoxFuture<'static, Result<(), Error>>;

/// How a supervised operation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The workflow finished within the timeout
    Succeeded,
    /// The workflow failed; the machine was marked `Error`
    Failed(String),
    /// The controller is shutting down; the machine is left for the next run
    Interrupted,
    /// The timeout elapsed first; the machine was marked `Error`
    TimedOut {
        /// Whether the cancelled workflow still reported success
        late_success: bool,
    },
}

/// Handle on a supervised operation
pub struct OperationHandle {
    supervisor: JoinHandle<OperationOutcome>,
}

impl OperationHandle {
    /// Wait for the operation and its bookkeeping to finish
    pub async fn wait(self) -> OperationOutcome {
        match self.supervisor.await {
            Ok(outcome) => outcome,
            Err(e) => OperationOutcome::Failed(format!("supervisor task failed: {e}")),
        }
    }
}

/// Launch `workflow` in the background for `input.machine`
///
/// Returns `None` without launching if an operation for the machine is
/// already in flight.
pub fn spawn_operation<F>(
    ctx: &Arc<Context>,
    kind: OperationKind,
    input: WorkflowInput,
    workflow: F,
) -> Option<OperationHandle>
where
    F: FnOnce(Arc<Context>, WorkflowInput) -> WorkflowFuture,
{
    let namespace = input.namespace();
    let name = input.name();
    let key = machine_key(&namespace, &name);
    let cancel = input.cancel.clone();

    if !ctx.operations.try_register(&key, kind) {
        debug!(machine = %name, operation = %kind, "operation already in flight");
        return None;
    }

    let span = info_span!("operation", machine = %name, namespace = %namespace, operation = %kind);
    let machine = input.machine.clone();
    let task = tokio::spawn(workflow(ctx.clone(), input).instrument(span.clone()));

    let ctx = ctx.clone();
    let supervisor = tokio::spawn(
        async move {
            info!("operation started");
            let outcome = supervise(&ctx, kind, &machine, task, &cancel).await;
            ctx.operations.remove(&key);
            outcome
        }
        .instrument(span),
    );

    Some(OperationHandle { supervisor })
}

fn joined(result: Result<Result<(), Error>, JoinError>) -> Result<(), Error> {
    result.map_err(|e| Error::internal_with_context("runner", format!("workflow task failed: {e}")))?
}

fn failure_reason(err: &Error) -> MachineErrorReason {
    match err {
        Error::Command { .. } => MachineErrorReason::CommandFailed,
        Error::Provisioner { .. } => MachineErrorReason::ProvisionFailed,
        _ => MachineErrorReason::OperationFailed,
    }
}

async fn supervise(
    ctx: &Context,
    kind: OperationKind,
    machine: &FoundryMachine,
    mut task: JoinHandle<Result<(), Error>>,
    cancel: &CancellationToken,
) -> OperationOutcome {
    let timeout = ctx.config.operation_timeout;

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(result) => match joined(result) {
            Ok(()) => {
                info!("operation finished");
                OperationOutcome::Succeeded
            }
            Err(Error::Cancelled { .. }) if ctx.shutdown.is_cancelled() => {
                info!("operation interrupted by shutdown");
                OperationOutcome::Interrupted
            }
            Err(e) => {
                match e.command() {
                    Some(command) => error!(error = %e, command, "operation failed"),
                    None => error!(error = %e, "operation failed"),
                }
                let message = e.to_string();
                mark_failed(
                    ctx,
                    kind,
                    machine,
                    failure_reason(&e),
                    reasons::OPERATION_FAILED,
                    &message,
                )
                .await;
                OperationOutcome::Failed(message)
            }
        },
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "operation timed out, cancelling");
            cancel.cancel();
            let message = format!("{kind} did not finish within {}s", timeout.as_secs());
            mark_failed(
                ctx,
                kind,
                machine,
                MachineErrorReason::OperationTimedOut,
                reasons::OPERATION_TIMED_OUT,
                &message,
            )
            .await;

            let late = joined(task.await);
            match &late {
                Ok(()) => warn!("operation finished after its timeout; machine stays in Error"),
                Err(e) => debug!(error = %e, "timed-out operation stopped"),
            }
            OperationOutcome::TimedOut {
                late_success: late.is_ok(),
            }
        }
    }
}

async fn mark_failed(
    ctx: &Context,
    kind: OperationKind,
    machine: &FoundryMachine,
    reason: MachineErrorReason,
    event_reason: &str,
    message: &str,
) {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    let written = patch_machine(ctx.kube.as_ref(), &namespace, &name, |m| {
        let status = m.status_mut();
        status.phase = Some(MachinePhase::Error);
        status.error_reason = Some(reason.clone());
        status.error_message = Some(message.to_string());
    })
    .await;

    if let Err(e) = written {
        error!(error = %e, "failed to record operation failure on machine");
    }

    ctx.events
        .publish(
            &machine.object_ref(&()),
            EventType::Warning,
            event_reason,
            kind.event_action(),
            Some(message.to_string()),
        )
        .await;
}
