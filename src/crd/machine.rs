//! FoundryMachine Custom Resource Definition
//!
//! A FoundryMachine is one node of a cluster. The namespace of the record is
//! the cluster's namespace; `spec.clusterRef` names the FoundryCluster in it.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MachineErrorReason, MachinePhase, MachineRole, SshConfig};
use crate::MACHINE_FINALIZER;

/// Annotation holding the address assigned by the infrastructure provisioner
pub const IP_ANNOTATION: &str = "maas-ip";

/// Annotation holding the provisioner's identifier for the machine
pub const SYSTEM_ID_ANNOTATION: &str = "maas-system-id";

/// Annotation holding the hostname reported by the provisioner
pub const HOSTNAME_ANNOTATION: &str = "maas-hostname";

/// Specification for a FoundryMachine. Immutable after creation.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "foundry.dev",
    version = "v1alpha1",
    kind = "FoundryMachine",
    plural = "foundrymachines",
    shortname = "fm",
    status = "FoundryMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".metadata.annotations.maas-ip"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FoundryMachineSpec {
    /// Roles this machine plays (control-plane, etcd, worker)
    pub roles: Vec<MachineRole>,

    /// Sizing class passed to the infrastructure provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    /// Name of the owning FoundryCluster in this namespace
    pub cluster_ref: String,

    /// Remote-access settings; the host is filled in from the provisioner
    /// when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_config: Option<SshConfig>,
}

impl FoundryMachineSpec {
    /// True when the machine carries the control-plane role
    pub fn is_control_plane(&self) -> bool {
        self.roles.contains(&MachineRole::ControlPlane)
    }
}

/// Observed state of a FoundryMachine. Written only by the controller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoundryMachineStatus {
    /// Lifecycle phase; absent until the create workflow ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    /// Identifier assigned by the infrastructure provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,

    /// Kubernetes version the node runs (or is being installed with)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Remote-access settings resolved at create time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_config: Option<SshConfig>,

    /// Time of the last status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Why the machine entered the Error phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineErrorReason>,

    /// Human-readable failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FoundryMachine {
    /// Current phase, `None` while unset
    pub fn phase(&self) -> Option<&MachinePhase> {
        self.status.as_ref().and_then(|s| s.phase.as_ref())
    }

    /// Observed Kubernetes version
    pub fn kubernetes_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.kubernetes_version.as_deref())
    }

    /// True when the machine carries the control-plane role
    pub fn is_control_plane(&self) -> bool {
        self.spec.is_control_plane()
    }

    /// Non-empty annotation value
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Address assigned by the infrastructure provisioner
    pub fn provisioned_ip(&self) -> Option<&str> {
        self.annotation(IP_ANNOTATION)
    }

    /// Provisioner identifier recorded at create time
    pub fn provisioner_id(&self) -> Option<&str> {
        self.annotation(SYSTEM_ID_ANNOTATION)
    }

    /// Host to reach the machine on
    ///
    /// Prefers the address resolved into status, then the one from the spec,
    /// then the provisioner annotation.
    pub fn remote_host(&self) -> Option<&str> {
        let from_status = self
            .status
            .as_ref()
            .and_then(|s| s.ssh_config.as_ref())
            .map(|c| c.host.as_str());
        let from_spec = self.spec.ssh_config.as_ref().map(|c| c.host.as_str());

        from_status
            .filter(|h| !h.is_empty())
            .or_else(|| from_spec.filter(|h| !h.is_empty()))
            .or_else(|| self.provisioned_ip())
    }

    /// True once a deletion timestamp was set
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True while the cleanup finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == MACHINE_FINALIZER)
    }

    /// Add the cleanup finalizer if missing. Returns true when added.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.finalizers_mut().push(MACHINE_FINALIZER.to_string());
        true
    }

    /// Remove the cleanup finalizer. Returns true when removed.
    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.finalizers().len();
        self.finalizers_mut().retain(|f| f != MACHINE_FINALIZER);
        self.finalizers().len() != before
    }

    /// Set an annotation only if it has no value yet
    ///
    /// Provisioner annotations are written once at create time and never
    /// overwritten afterwards.
    pub fn set_annotation_once(&mut self, key: &str, value: &str) {
        let annotations = self.annotations_mut();
        match annotations.get(key) {
            Some(existing) if !existing.is_empty() => {}
            _ => {
                annotations.insert(key.to_string(), value.to_string());
            }
        }
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut FoundryMachineStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
