//! Infrastructure provisioner capability
//!
//! A provisioner hands out a physical or virtual machine booted with a given
//! cloud-init document and takes it back on delete. [`MaasProvisioner`] talks
//! to a MAAS region controller; tests use mocks or in-memory fakes.

mod boot_config;
mod maas;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use boot_config::{
    control_plane_boot_config, worker_boot_config, BOOTSTRAP_TOKEN, CERT_ARCHIVE_PATH,
    FLANNEL_MANIFEST_URL, POD_NETWORK_CIDR,
};
pub use maas::{MaasConfig, MaasCredentials, MaasProvisioner};

/// What to provision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Machine name, used as the hostname where the provisioner allows it
    pub name: String,
    /// Sizing class, if the machine asked for one
    pub instance_type: Option<String>,
    /// Cloud-init document run on first boot
    pub boot_config: String,
}

/// A machine handed out by the provisioner
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionedMachine {
    /// Provisioner identifier, needed to release the machine
    pub system_id: String,
    /// Hostname reported by the provisioner
    pub hostname: Option<String>,
    /// Network addresses; the first one is the machine's address
    pub addresses: Vec<String>,
}

impl ProvisionedMachine {
    /// The address the machine is reached on
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .map(String::as_str)
            .find(|a| !a.is_empty())
    }
}

/// Trait for allocating and releasing machines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision a machine and boot it with `request.boot_config`
    ///
    /// Returns once the machine reports its network addresses. Implementations
    /// release a half-provisioned machine before returning an error.
    async fn create(
        &self,
        request: &ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedMachine, Error>;

    /// Release the machine with the given provisioner identifier
    ///
    /// Releasing a machine the provisioner no longer knows succeeds.
    async fn delete(&self, system_id: &str, cancel: &CancellationToken) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_address_skips_blank_entries() {
        let machine = ProvisionedMachine {
            system_id: "abc".to_string(),
            hostname: None,
            addresses: vec![String::new(), "10.0.0.8".to_string()],
        };
        assert_eq!(machine.primary_address(), Some("10.0.0.8"));
        assert_eq!(ProvisionedMachine::default().primary_address(), None);
    }
}
