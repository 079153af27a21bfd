//! Create workflow: provision the machine and record where it landed

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::update_phase;
use crate::controller::Context;
use crate::crd::{
    FoundryCluster, FoundryMachine, MachinePhase, SshConfig, HOSTNAME_ANNOTATION, IP_ANNOTATION,
    SYSTEM_ID_ANNOTATION,
};
use crate::events::{actions, reasons};
use crate::kubeconfig::Kubeconfig;
use crate::pki::CertificateAuthorityBundle;
use crate::provisioner::{
    control_plane_boot_config, worker_boot_config, ProvisionRequest, ProvisionedMachine,
};
use crate::store::patch_machine;
use crate::Error;

/// Outcome of preparing a boot configuration
enum BootPlan {
    /// Boot configuration ready; the bundle is set for control planes
    Ready {
        boot_config: String,
        bundle: Option<CertificateAuthorityBundle>,
    },
    /// Stop this dispatch with the given action
    Defer(Action),
}

/// Provision a machine that has no phase yet
///
/// Adds the cleanup finalizer, builds the boot configuration (certificate
/// bundle for control planes, join command for workers), asks the
/// provisioner for a machine, and records its address and identifier
/// together with the `Provisioning` phase. A control plane's admin
/// kubeconfig is published last.
#[instrument(skip(ctx, machine, cluster), fields(machine = %machine.name_any()))]
pub async fn create_machine(
    ctx: &Context,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
) -> Result<Action, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    let machine = if machine.has_finalizer() {
        machine.clone()
    } else {
        let Some(stored) = patch_machine(ctx.kube.as_ref(), &namespace, &name, |m| {
            m.add_finalizer();
        })
        .await?
        else {
            return Ok(Action::await_change());
        };
        debug!("added cleanup finalizer");
        stored
    };

    if let (Some(system_id), Some(ip)) = (machine.provisioner_id(), machine.provisioned_ip()) {
        // Infrastructure was recorded but the phase write did not land.
        warn!(%system_id, %ip, "machine already provisioned, recording phase only");
        let provisioned = ProvisionedMachine {
            system_id: system_id.to_string(),
            hostname: machine.annotation(HOSTNAME_ANNOTATION).map(str::to_string),
            addresses: vec![ip.to_string()],
        };
        record_provisioned(ctx, &machine, cluster, &provisioned, ip).await?;
        return Ok(Action::await_change());
    }

    let (boot_config, bundle) = match boot_plan(ctx, &machine, cluster).await? {
        BootPlan::Ready {
            boot_config,
            bundle,
        } => (boot_config, bundle),
        BootPlan::Defer(action) => return Ok(action),
    };

    let request = ProvisionRequest {
        name: name.clone(),
        instance_type: machine.spec.instance_type.clone(),
        boot_config,
    };
    let cancel = ctx.shutdown.child_token();
    let provisioned = ctx.provisioner.create(&request, &cancel).await?;

    let Some(ip) = provisioned.primary_address().map(str::to_string) else {
        warn!(system_id = %provisioned.system_id, "provisioned machine reported no address, releasing");
        if let Err(e) = ctx.provisioner.delete(&provisioned.system_id, &cancel).await {
            warn!(error = %e, "failed to release machine without address");
        }
        return Err(Error::provisioner(&name, "provisioned machine reported no address"));
    };
    info!(system_id = %provisioned.system_id, %ip, "machine provisioned");

    if record_provisioned(ctx, &machine, cluster, &provisioned, &ip)
        .await?
        .is_none()
    {
        warn!("machine deleted while provisioning");
        return Ok(Action::await_change());
    }

    if let Some(bundle) = bundle {
        let kubeconfig = Kubeconfig::admin(&cluster.name_any(), &ip, &bundle);
        ctx.kube.apply_secret(&kubeconfig.to_secret(&namespace)?).await?;
        info!("published admin kubeconfig");
    }

    Ok(Action::await_change())
}

async fn boot_plan(
    ctx: &Context,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
) -> Result<BootPlan, Error> {
    if machine.is_control_plane() {
        let bundle = CertificateAuthorityBundle::generate(&cluster.name_any())?;
        let boot_config = control_plane_boot_config(&bundle.boot_archive_base64()?);
        return Ok(BootPlan::Ready {
            boot_config,
            bundle: Some(bundle),
        });
    }

    let namespace = machine.namespace().unwrap_or_default();
    let control_plane = match ctx.kube.find_control_plane(&namespace).await {
        Ok(cp) => cp,
        Err(e @ Error::ControlPlaneLookup { .. }) => {
            warn!(error = %e, "cannot create worker without a control plane");
            ctx.events
                .publish(
                    &machine.object_ref(&()),
                    EventType::Warning,
                    reasons::CONTROL_PLANE_MISSING,
                    actions::PROVISION,
                    Some(e.to_string()),
                )
                .await;
            // A control-plane change re-dispatches this machine.
            return Ok(BootPlan::Defer(Action::await_change()));
        }
        Err(e) => return Err(e),
    };

    match control_plane.provisioned_ip() {
        Some(ip) => Ok(BootPlan::Ready {
            boot_config: worker_boot_config(ip),
            bundle: None,
        }),
        None => {
            debug!(
                control_plane = %control_plane.name_any(),
                "control plane has no address yet, waiting"
            );
            Ok(BootPlan::Defer(Action::requeue(ctx.config.dependency_requeue)))
        }
    }
}

async fn record_provisioned(
    ctx: &Context,
    machine: &FoundryMachine,
    cluster: &FoundryCluster,
    provisioned: &ProvisionedMachine,
    ip: &str,
) -> Result<Option<FoundryMachine>, Error> {
    let version = cluster.spec.kubernetes_version.clone();
    update_phase(
        ctx,
        machine,
        MachinePhase::Provisioning,
        actions::PROVISION,
        |m| {
            m.set_annotation_once(IP_ANNOTATION, ip);
            m.set_annotation_once(SYSTEM_ID_ANNOTATION, &provisioned.system_id);
            if let Some(hostname) = provisioned.hostname.as_deref() {
                m.set_annotation_once(HOSTNAME_ANNOTATION, hostname);
            }

            let ssh_config = SshConfig {
                host: ip.to_string(),
                ..m.spec.ssh_config.clone().unwrap_or_default()
            };
            let status = m.status_mut();
            status.system_id = Some(provisioned.system_id.clone());
            status.kubernetes_version = Some(version.clone());
            status.ssh_config = Some(ssh_config);
        },
    )
    .await
}
