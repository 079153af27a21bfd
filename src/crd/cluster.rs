//! FoundryCluster Custom Resource Definition
//!
//! A FoundryCluster owns the machines in its namespace. Only one cluster
//! record is expected per namespace.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ClusterPhase;

/// Specification for a FoundryCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "foundry.dev",
    version = "v1alpha1",
    kind = "FoundryCluster",
    plural = "foundryclusters",
    shortname = "fc",
    status = "FoundryClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"K8s","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FoundryClusterSpec {
    /// Kubernetes version every machine converges to
    pub kubernetes_version: String,

    /// Name of the Secret (same namespace) holding the SSH private key
    pub secret: String,
}

/// Status for a FoundryCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoundryClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Time of the last status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl FoundryClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }
}

impl FoundryCluster {
    /// True when the whole cluster is being torn down
    ///
    /// Machines of a stopping cluster are released without draining their
    /// nodes first.
    pub fn is_stopping(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == ClusterPhase::Stopping)
    }
}
