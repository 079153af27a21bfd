//! Shared types for Foundry CRDs

use std::fmt;

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role a machine plays in its cluster. Roles are not exclusive.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MachineRole {
    /// Runs the Kubernetes API server; bootstraps the cluster
    #[serde(alias = "master")]
    ControlPlane,
    /// Runs an etcd member
    Etcd,
    /// Runs workloads and joins an existing control plane
    Worker,
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Etcd => write!(f, "etcd"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Lifecycle phase of a machine
///
/// Stored as a plain string so that a value written by another version of
/// the controller still deserializes; such values land in `Unrecognized` and
/// are rejected by the state machine instead of failing the watch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MachinePhase {
    /// Infrastructure requested; node bootstrap pending or running
    Provisioning,
    /// Node joined the cluster at the recorded Kubernetes version
    Ready,
    /// Kubernetes upgrade running on the node
    Upgrading,
    /// Teardown running
    Deleting,
    /// A workflow failed; requires manual intervention
    Error,
    /// Any value this controller does not know
    Unrecognized(String),
}

impl MachinePhase {
    /// String form as persisted in `status.phase`
    pub fn as_str(&self) -> &str {
        match self {
            Self::Provisioning => "Provisioning",
            Self::Ready => "Ready",
            Self::Upgrading => "Upgrading",
            Self::Deleting => "Deleting",
            Self::Error => "Error",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl From<String> for MachinePhase {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Provisioning" => Self::Provisioning,
            "Ready" => Self::Ready,
            "Upgrading" => Self::Upgrading,
            "Deleting" => Self::Deleting,
            "Error" => Self::Error,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<MachinePhase> for String {
    fn from(phase: MachinePhase) -> Self {
        match phase {
            MachinePhase::Unrecognized(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JsonSchema for MachinePhase {
    fn schema_name() -> String {
        "MachinePhase".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

/// Why a machine entered the Error phase
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineErrorReason {
    /// The owning cluster record does not exist
    ResourceFailed,
    /// The infrastructure provisioner rejected a request
    ProvisionFailed,
    /// A remote command failed on the machine
    CommandFailed,
    /// A workflow failed for a reason other than a remote command
    OperationFailed,
    /// A workflow exceeded the operation timeout
    OperationTimedOut,
}

impl fmt::Display for MachineErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceFailed => write!(f, "ResourceFailed"),
            Self::ProvisionFailed => write!(f, "ProvisionFailed"),
            Self::CommandFailed => write!(f, "CommandFailed"),
            Self::OperationFailed => write!(f, "OperationFailed"),
            Self::OperationTimedOut => write!(f, "OperationTimedOut"),
        }
    }
}

/// Cluster lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Cluster record accepted, no machines running yet
    #[default]
    Pending,
    /// Machines are being provisioned
    Provisioning,
    /// All machines are ready
    Ready,
    /// Machines are being upgraded
    Upgrading,
    /// The whole cluster is being torn down
    Stopping,
    /// Cluster has encountered an error
    Error,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Remote-access settings for a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// Address to connect to
    #[serde(default)]
    pub host: String,

    /// SSH port (default 22)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Login user (default root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl SshConfig {
    /// Settings pointing at `host` with default port and user
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }
}
