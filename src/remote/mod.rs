//! Remote execution capability
//!
//! Workflows drive a machine through named operations (install runtime,
//! kubeadm init, join, upgrade, drain, ...) without knowing how the command
//! reaches the machine. [`RemoteExecutor`] is the seam; [`SshExecutor`] is the
//! production implementation over the system `ssh` client.

mod scripts;
mod ssh;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use crate::crd::FoundryMachine;
use crate::Error;

pub use scripts::{render_script, script_for};
pub use ssh::{SshExecutor, SshExecutorConfig};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default login user
pub const DEFAULT_SSH_USER: &str = "root";

/// Key/value arguments for a remote operation
pub type CommandArgs = BTreeMap<String, String>;

/// Argument keys understood by the operations
pub mod args {
    /// Join token produced by the control plane
    pub const TOKEN: &str = "token";
    /// Control-plane address a worker joins
    pub const MASTER: &str = "master";
    /// Target Kubernetes version
    pub const VERSION: &str = "version";
    /// Admin kubeconfig document of the control plane
    pub const ADMIN_CONF: &str = "admin.conf";
    /// Pod network range for `kubeadm init`
    pub const POD_NETWORK_CIDR: &str = "pod_network_cidr";
    /// Pod network add-on manifest applied after init
    pub const NETWORK_MANIFEST: &str = "network_manifest";
}

/// Named operations a machine can be driven through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteOperation {
    /// Install the container runtime
    InstallRuntime,
    /// Install kubeadm, kubelet and kubectl
    InstallKubernetes,
    /// Initialize a new cluster on the control-plane machine
    KubeadmInit,
    /// Print a fresh join token on the control-plane machine
    CreateJoinToken,
    /// Join a worker to the control plane
    KubeadmJoin,
    /// Upgrade the control-plane machine
    UpgradeMaster,
    /// Upgrade a worker node
    UpgradeNode,
    /// Drain the node and remove it from the cluster
    DrainAndDeleteNode,
    /// Reset kubeadm state on the machine
    DeleteNode,
    /// Print the admin kubeconfig of the control-plane machine
    FetchAdminKubeconfig,
}

impl RemoteOperation {
    /// Stable name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstallRuntime => "install-runtime",
            Self::InstallKubernetes => "install-kubernetes",
            Self::KubeadmInit => "kubeadm-init",
            Self::CreateJoinToken => "create-join-token",
            Self::KubeadmJoin => "kubeadm-join",
            Self::UpgradeMaster => "upgrade-master",
            Self::UpgradeNode => "upgrade-node",
            Self::DrainAndDeleteNode => "drain-and-delete-node",
            Self::DeleteNode => "delete-node",
            Self::FetchAdminKubeconfig => "fetch-admin-kubeconfig",
        }
    }
}

impl fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A remote command exited unsuccessfully
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operation} failed on {host} (exit code {exit_code:?}): `{command}`: {stderr}")]
pub struct CommandError {
    /// Operation that was running
    pub operation: RemoteOperation,
    /// Host the command ran on
    pub host: String,
    /// The command line that failed
    pub command: String,
    /// Exit code, `None` if the process was killed
    pub exit_code: Option<i32>,
    /// Trimmed standard error
    pub stderr: String,
}

impl CommandError {
    /// Create a command failure
    pub fn new(
        operation: RemoteOperation,
        host: impl Into<String>,
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            host: host.into(),
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// The failing command line
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// SSH private key material, zeroized on drop and redacted from debug output
#[derive(Clone)]
pub struct PrivateKey(Arc<Zeroizing<Vec<u8>>>);

impl PrivateKey {
    /// Wrap raw PEM bytes
    pub fn new(pem: Vec<u8>) -> Self {
        Self(Arc::new(Zeroizing::new(pem)))
    }

    /// Raw PEM bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// Where and as whom to run a remote operation
#[derive(Clone, Debug)]
pub struct RemoteTarget {
    /// Address of the machine
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Key to authenticate with
    pub private_key: PrivateKey,
}

impl RemoteTarget {
    /// Build the target for a machine
    ///
    /// Fails with a dependency-not-ready error while the machine has no
    /// reachable address yet.
    pub fn for_machine(machine: &FoundryMachine, private_key: &PrivateKey) -> Result<Self, Error> {
        let name = kube::ResourceExt::name_any(machine);
        let host = machine
            .remote_host()
            .ok_or_else(|| Error::dependency_not_ready(&name, "machine has no address yet"))?;

        let configured = machine
            .status
            .as_ref()
            .and_then(|s| s.ssh_config.as_ref())
            .or(machine.spec.ssh_config.as_ref());

        Ok(Self {
            host: host.to_string(),
            port: configured.and_then(|c| c.port).unwrap_or(DEFAULT_SSH_PORT),
            user: configured
                .and_then(|c| c.username.clone())
                .unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
            private_key: private_key.clone(),
        })
    }
}

/// Trait for running named operations on a machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `operation` on `target` and return its standard output
    ///
    /// Returns [`Error::Command`] if the command fails and
    /// [`Error::Cancelled`] if `cancel` fires first.
    async fn run(
        &self,
        target: &RemoteTarget,
        operation: RemoteOperation,
        args: &CommandArgs,
        cancel: &CancellationToken,
    ) -> Result<String, Error>;
}
