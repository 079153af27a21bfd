//! Upgrade workflow: move a node to the cluster's Kubernetes version
//!
//! The control plane upgrades itself with `kubeadm upgrade apply`. Workers
//! wait until the control plane reports `Ready` at the target version, then
//! drain, upgrade and uncordon themselves using the control plane's admin
//! kubeconfig.

use std::sync::Arc;

use futures::FutureExt;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::{finish_operation, run_remote, update_phase, upgrade_readiness, Readiness};
use crate::controller::Context;
use crate::crd::{FoundryCluster, FoundryMachine, MachinePhase};
use crate::events::actions;
use crate::remote::{args, CommandArgs, RemoteOperation, RemoteTarget};
use crate::retry::retry;
use crate::runner::{
    ensure_active, prepare_operation, spawn_operation, OperationKind, WorkflowInput,
};
use crate::Error;

/// Start upgrading a `Ready` machine whose version lags the cluster
///
/// Waits while other machines are still being created or deleted and
/// refuses while any machine of the cluster is in `Error`.
#[instrument(skip(ctx, machine, cluster), fields(machine = %machine.name_any()))]
pub async fn start_upgrade(
    ctx: &Arc<Context>,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
) -> Result<Action, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let machines = ctx.kube.list_machines(&namespace).await?;

    match upgrade_readiness(&machines) {
        Readiness::Proceed => {}
        Readiness::Wait(reason) => {
            debug!(%reason, "upgrade waiting on cluster");
            return Ok(Action::requeue(ctx.config.dependency_requeue));
        }
        Readiness::Blocked(reason) => {
            warn!(%reason, "upgrade blocked");
            return Ok(Action::await_change());
        }
    }

    let mut input = prepare_operation(ctx, machine, cluster).await?;
    let Some(upgrading) = update_phase(
        ctx,
        machine,
        MachinePhase::Upgrading,
        actions::UPGRADE,
        |_| {},
    )
    .await?
    else {
        return Ok(Action::await_change());
    };
    input.machine = upgrading;

    launch(ctx, input);
    Ok(Action::await_change())
}

/// Relaunch the upgrade of a machine left in `Upgrading`
///
/// Covers a controller restart in the middle of an upgrade; every upgrade
/// step is safe to repeat.
pub async fn resume_upgrade(
    ctx: &Arc<Context>,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
) -> Result<Action, Error> {
    let input = prepare_operation(ctx, machine, cluster).await?;
    info!(machine = %machine.name_any(), "resuming interrupted upgrade");
    launch(ctx, input);
    Ok(Action::await_change())
}

fn launch(ctx: &Arc<Context>, input: WorkflowInput) {
    let spawned = spawn_operation(ctx, OperationKind::Upgrade, input, |ctx, input| {
        upgrade_machine(ctx, input).boxed()
    });
    if spawned.is_none() {
        debug!("upgrade already in flight");
    }
}

/// Upgrade the node and record the new version with `Ready`
#[instrument(skip(ctx, input), fields(machine = %input.name()))]
pub async fn upgrade_machine(ctx: Arc<Context>, input: WorkflowInput) -> Result<(), Error> {
    let version = input.cluster.spec.kubernetes_version.clone();
    let target = RemoteTarget::for_machine(&input.machine, &input.private_key)?;

    if input.machine.is_control_plane() {
        run_remote(
            &ctx,
            &input,
            &target,
            RemoteOperation::UpgradeMaster,
            CommandArgs::from([(args::VERSION.to_string(), version.clone())]),
        )
        .await?;
    } else {
        let control_plane = wait_for_control_plane(&ctx, &input, &version).await?;
        let cp_target = RemoteTarget::for_machine(&control_plane, &input.private_key)?;
        let admin_conf = run_remote(
            &ctx,
            &input,
            &cp_target,
            RemoteOperation::FetchAdminKubeconfig,
            CommandArgs::new(),
        )
        .await?;

        run_remote(
            &ctx,
            &input,
            &target,
            RemoteOperation::UpgradeNode,
            CommandArgs::from([
                (args::ADMIN_CONF.to_string(), admin_conf),
                (args::VERSION.to_string(), version.clone()),
            ]),
        )
        .await?;
    }

    finish_operation(&ctx, &input, OperationKind::Upgrade, MachinePhase::Ready, |m| {
        m.status_mut().kubernetes_version = Some(version.clone());
    })
    .await?;
    info!(%version, "node upgraded");
    Ok(())
}

/// Poll until the control plane is `Ready` at `version`
async fn wait_for_control_plane(
    ctx: &Context,
    input: &WorkflowInput,
    version: &str,
) -> Result<FoundryMachine, Error> {
    let poll = ctx.config.upgrade_poll;
    let namespace = input.namespace();
    let name = input.name();
    let (namespace, name) = (namespace.as_str(), name.as_str());

    let cancel = &input.cancel;
    retry(poll.attempts, poll.interval, "control_plane_upgrade", cancel, move || async move {
        ensure_active(&input.cancel, OperationKind::Upgrade.name())?;

        let control_plane = ctx.kube.find_control_plane(namespace).await?;
        let ready = control_plane.phase() == Some(&MachinePhase::Ready)
            && control_plane.kubernetes_version() == Some(version);
        if !ready {
            return Err(Error::dependency_not_ready(
                name,
                format!(
                    "control plane {} is {} at {}",
                    control_plane.name_any(),
                    control_plane.phase().map(|p| p.as_str()).unwrap_or("unset"),
                    control_plane.kubernetes_version().unwrap_or("unknown"),
                ),
            ));
        }
        Ok(control_plane)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PollConfig, ReconcilerConfig};
    use crate::runner::{machine_key, OperationOutcome};
    use crate::testing::{
        control_plane_machine, provisioned, sample_cluster, worker_machine, FakeExecutor,
        FakeProvisioner, Harness, FAKE_ADMIN_CONF,
    };
    use std::time::Duration;

    fn input_for(h: &Harness, name: &str, version: &str) -> WorkflowInput {
        WorkflowInput {
            machine: h.store.machine("prod", name).unwrap(),
            cluster: sample_cluster("prod", version),
            private_key: crate::remote::PrivateKey::new(b"key".to_vec()),
            cancel: h.ctx.shutdown.child_token(),
        }
    }

    fn seed(h: &Harness, cp_phase: MachinePhase, cp_version: &str) {
        h.store.insert_machine(provisioned(
            control_plane_machine("prod", "cp-0"),
            "10.0.0.2",
            cp_phase,
            cp_version,
        ));
        h.store.insert_machine(provisioned(
            worker_machine("prod", "w-0"),
            "10.0.0.3",
            MachinePhase::Upgrading,
            "1.14.0",
        ));
    }

    #[tokio::test]
    async fn control_plane_upgrades_itself() {
        let h = Harness::new().with_cluster("prod", "1.15.0");
        seed(&h, MachinePhase::Upgrading, "1.14.0");

        upgrade_machine(h.ctx.clone(), input_for(&h, "cp-0", "1.15.0"))
            .await
            .unwrap();

        assert_eq!(
            h.executor.operations_on("10.0.0.2"),
            vec![RemoteOperation::UpgradeMaster]
        );
        let machine = h.store.machine("prod", "cp-0").unwrap();
        assert_eq!(machine.phase(), Some(&MachinePhase::Ready));
        assert_eq!(machine.kubernetes_version(), Some("1.15.0"));
    }

    #[tokio::test]
    async fn worker_upgrades_with_admin_kubeconfig_once_control_plane_is_done() {
        let h = Harness::new().with_cluster("prod", "1.15.0");
        seed(&h, MachinePhase::Ready, "1.15.0");

        upgrade_machine(h.ctx.clone(), input_for(&h, "w-0", "1.15.0"))
            .await
            .unwrap();

        assert_eq!(
            h.executor.operations_on("10.0.0.2"),
            vec![RemoteOperation::FetchAdminKubeconfig]
        );
        let upgrade = h
            .executor
            .calls()
            .into_iter()
            .find(|c| c.operation == RemoteOperation::UpgradeNode)
            .unwrap();
        assert_eq!(upgrade.host, "10.0.0.3");
        assert_eq!(upgrade.args[args::ADMIN_CONF], FAKE_ADMIN_CONF);
        assert_eq!(upgrade.args[args::VERSION], "1.15.0");
        assert_eq!(h.store.machine("prod", "w-0").unwrap().kubernetes_version(), Some("1.15.0"));
    }

    /// Story: the cluster moves to 1.15.0 but the control plane is still
    /// on 1.14.0. The worker polls and never runs its own upgrade.
    #[tokio::test(start_paused = true)]
    async fn story_worker_never_upgrades_ahead_of_control_plane() {
        let config = ReconcilerConfig::default()
            .with_poll(PollConfig::new(5, Duration::from_secs(10)));
        let h = Harness::with(FakeProvisioner::new(), FakeExecutor::new(), config)
            .with_cluster("prod", "1.15.0");
        seed(&h, MachinePhase::Ready, "1.14.0");

        let err = upgrade_machine(h.ctx.clone(), input_for(&h, "w-0", "1.15.0"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DependencyNotReady { .. }));
        assert_eq!(h.executor.count(RemoteOperation::UpgradeNode), 0);
        assert_eq!(h.executor.count(RemoteOperation::FetchAdminKubeconfig), 0);
        assert_eq!(h.phase("prod", "w-0"), Some(MachinePhase::Upgrading));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_proceeds_once_control_plane_catches_up() {
        let h = Harness::new().with_cluster("prod", "1.15.0");
        seed(&h, MachinePhase::Upgrading, "1.14.0");

        let store = h.store.clone();
        let catch_up = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(35)).await;
            store.update_machine("prod", "cp-0", |m| {
                let status = m.status_mut();
                status.phase = Some(MachinePhase::Ready);
                status.kubernetes_version = Some("1.15.0".to_string());
            });
        });

        upgrade_machine(h.ctx.clone(), input_for(&h, "w-0", "1.15.0"))
            .await
            .unwrap();
        catch_up.await.unwrap();

        assert_eq!(h.executor.count(RemoteOperation::UpgradeNode), 1);
        assert_eq!(h.phase("prod", "w-0"), Some(MachinePhase::Ready));
    }

    #[tokio::test]
    async fn error_machine_blocks_upgrade_start() {
        let h = Harness::new().with_cluster("prod", "1.15.0");
        h.store.insert_machine(provisioned(
            control_plane_machine("prod", "cp-0"),
            "10.0.0.2",
            MachinePhase::Ready,
            "1.14.0",
        ));
        h.store.insert_machine(provisioned(
            worker_machine("prod", "w-0"),
            "10.0.0.3",
            MachinePhase::Error,
            "1.14.0",
        ));
        let machine = h.store.machine("prod", "cp-0").unwrap();

        let action = start_upgrade(&h.ctx, &machine, &sample_cluster("prod", "1.15.0"))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(h.phase("prod", "cp-0"), Some(MachinePhase::Ready));
        assert!(h.ctx.operations.is_empty());
    }

    #[tokio::test]
    async fn provisioning_sibling_delays_upgrade_start() {
        let h = Harness::new().with_cluster("prod", "1.15.0");
        h.store.insert_machine(provisioned(
            control_plane_machine("prod", "cp-0"),
            "10.0.0.2",
            MachinePhase::Ready,
            "1.14.0",
        ));
        h.store.insert_machine(provisioned(
            worker_machine("prod", "w-0"),
            "10.0.0.3",
            MachinePhase::Provisioning,
            "1.14.0",
        ));
        let machine = h.store.machine("prod", "cp-0").unwrap();

        let action = start_upgrade(&h.ctx, &machine, &sample_cluster("prod", "1.15.0"))
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(h.phase("prod", "cp-0"), Some(MachinePhase::Ready));
    }

    #[tokio::test]
    async fn upgrade_start_marks_upgrading_and_launches() {
        let h = Harness::new().with_cluster("prod", "1.15.0");
        h.executor.block(RemoteOperation::UpgradeMaster);
        h.store.insert_machine(provisioned(
            control_plane_machine("prod", "cp-0"),
            "10.0.0.2",
            MachinePhase::Ready,
            "1.14.0",
        ));
        let machine = h.store.machine("prod", "cp-0").unwrap();

        start_upgrade(&h.ctx, &machine, &sample_cluster("prod", "1.15.0"))
            .await
            .unwrap();

        assert_eq!(h.phase("prod", "cp-0"), Some(MachinePhase::Upgrading));
        assert_eq!(
            h.ctx.operations.kind(&machine_key("prod", "cp-0")),
            Some(OperationKind::Upgrade)
        );
        h.ctx.shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_control_plane_upgrade_lands_in_error() {
        let executor = FakeExecutor::with_responder(|target, op, _| match op {
            RemoteOperation::UpgradeMaster => Err(crate::remote::CommandError::new(
                op,
                &target.host,
                "kubeadm upgrade apply",
                Some(1),
                "preflight failed",
            )
            .into()),
            _ => Ok(String::new()),
        });
        let h = Harness::with(FakeProvisioner::new(), executor, ReconcilerConfig::default())
            .with_cluster("prod", "1.15.0");
        seed(&h, MachinePhase::Upgrading, "1.14.0");
        let machine = h.store.machine("prod", "cp-0").unwrap();

        let input = prepare_operation(&h.ctx, &machine, &sample_cluster("prod", "1.15.0"))
            .await
            .unwrap();
        let handle = spawn_operation(&h.ctx, OperationKind::Upgrade, input, |ctx, input| {
            upgrade_machine(ctx, input).boxed()
        })
        .unwrap();

        assert!(matches!(handle.wait().await, OperationOutcome::Failed(_)));
        assert_eq!(h.phase("prod", "cp-0"), Some(MachinePhase::Error));
    }
}
