//! Bootstrap workflow: turn a provisioned machine into a Kubernetes node

use std::sync::Arc;

use futures::FutureExt;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::{finish_operation, run_remote};
use crate::controller::Context;
use crate::crd::{FoundryCluster, FoundryMachine, MachinePhase};
use crate::provisioner::{BOOTSTRAP_TOKEN, FLANNEL_MANIFEST_URL, POD_NETWORK_CIDR};
use crate::remote::{args, CommandArgs, RemoteOperation, RemoteTarget};
use crate::retry::retry;
use crate::runner::{
    ensure_active, prepare_operation, spawn_operation, OperationKind, WorkflowInput,
};
use crate::Error;

/// Launch the bootstrap of a `Provisioning` machine in the background
pub async fn start_bootstrap(
    ctx: &Arc<Context>,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
) -> Result<Action, Error> {
    let input = prepare_operation(ctx, machine, cluster).await?;
    if spawn_operation(ctx, OperationKind::Bootstrap, input, |ctx, input| {
        bootstrap_machine(ctx, input).boxed()
    })
    .is_some()
    {
        info!(machine = %machine.name_any(), "bootstrap launched");
    }
    Ok(Action::await_change())
}

/// Install the runtime and Kubernetes packages, then init or join
///
/// Control planes run `kubeadm init` with the fixed bootstrap token. Workers
/// poll the control plane for a join token until it answers, then join it.
/// The machine is marked `Ready` at the cluster's version last.
#[instrument(skip(ctx, input), fields(machine = %input.name()))]
pub async fn bootstrap_machine(ctx: Arc<Context>, input: WorkflowInput) -> Result<(), Error> {
    let version = input.cluster.spec.kubernetes_version.clone();
    let target = RemoteTarget::for_machine(&input.machine, &input.private_key)?;

    run_remote(&ctx, &input, &target, RemoteOperation::InstallRuntime, CommandArgs::new()).await?;
    run_remote(
        &ctx,
        &input,
        &target,
        RemoteOperation::InstallKubernetes,
        CommandArgs::from([(args::VERSION.to_string(), version.clone())]),
    )
    .await?;

    if input.machine.is_control_plane() {
        run_remote(
            &ctx,
            &input,
            &target,
            RemoteOperation::KubeadmInit,
            CommandArgs::from([
                (args::TOKEN.to_string(), BOOTSTRAP_TOKEN.to_string()),
                (args::POD_NETWORK_CIDR.to_string(), POD_NETWORK_CIDR.to_string()),
                (args::NETWORK_MANIFEST.to_string(), FLANNEL_MANIFEST_URL.to_string()),
            ]),
        )
        .await?;
    } else {
        let (token, master) = wait_for_join_token(&ctx, &input).await?;
        run_remote(
            &ctx,
            &input,
            &target,
            RemoteOperation::KubeadmJoin,
            CommandArgs::from([
                (args::TOKEN.to_string(), token),
                (args::MASTER.to_string(), master),
            ]),
        )
        .await?;
    }

    finish_operation(&ctx, &input, OperationKind::Bootstrap, MachinePhase::Ready, |m| {
        m.status_mut().kubernetes_version = Some(version.clone());
    })
    .await?;
    info!(%version, "node bootstrapped");
    Ok(())
}

/// Ask the control plane for a join token until it hands one out
///
/// Returns the token and the control plane's address.
async fn wait_for_join_token(
    ctx: &Context,
    input: &WorkflowInput,
) -> Result<(String, String), Error> {
    let poll = ctx.config.join_token_poll;
    let namespace = input.namespace();
    let name = input.name();
    let (namespace, name) = (namespace.as_str(), name.as_str());

    retry(poll.attempts, poll.interval, "join_token", &input.cancel, move || async move {
        ensure_active(&input.cancel, OperationKind::Bootstrap.name())?;

        let control_plane = ctx.kube.find_control_plane(namespace).await?;
        let cp_target = RemoteTarget::for_machine(&control_plane, &input.private_key)?;
        let output = run_remote(
            ctx,
            input,
            &cp_target,
            RemoteOperation::CreateJoinToken,
            CommandArgs::new(),
        )
        .await?;

        let token = output.trim();
        if token.is_empty() {
            return Err(Error::dependency_not_ready(
                name,
                format!("control plane {} returned no join token", control_plane.name_any()),
            ));
        }
        debug!(control_plane = %control_plane.name_any(), "got join token");
        Ok((token.to_string(), cp_target.host))
    })
    .await
}
