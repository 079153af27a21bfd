//! Foundry - Kubernetes operator for bare-metal cluster machines
//!
//! Foundry reconciles `FoundryMachine` records into running Kubernetes nodes:
//! it asks an infrastructure provisioner for a machine, bootstraps it over
//! SSH with kubeadm, upgrades it when the owning `FoundryCluster` asks for a
//! new Kubernetes version, and drains and releases it on delete.
//!
//! # Architecture
//!
//! - The controller is level-triggered: every change to a machine (or its
//!   cluster) re-runs [`controller::reconcile`] against fresh records.
//! - Long-running work (bootstrap, upgrade, teardown) runs on background
//!   tasks started by [`runner`], bounded by a timeout and cancellable.
//! - Workers wait on their cluster's control-plane machine by polling it.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (FoundryMachine, FoundryCluster)
//! - [`controller`] - Reconciliation dispatcher and phase state machine
//! - [`workflow`] - Create, bootstrap, upgrade and delete procedures
//! - [`runner`] - Background operation runner with timeout and cancellation
//! - [`store`] - Record store access and optimistic-concurrency patching
//! - [`provisioner`] - Infrastructure provisioner capability (MAAS)
//! - [`remote`] - Remote execution capability (SSH)
//! - [`pki`] - Certificate authority bundle for new control planes
//! - [`kubeconfig`] - Admin kubeconfig document
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Polling and backoff helpers
//! - [`config`] - Reconciler timing configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod kubeconfig;
pub mod pki;
pub mod provisioner;
pub mod remote;
pub mod retry;
pub mod runner;
pub mod store;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Constants
// =============================================================================

/// Port the Kubernetes API server listens on
pub const KUBE_API_PORT: u16 = 6443;

/// Finalizer held on a machine while infrastructure cleanup is owed
pub const MACHINE_FINALIZER: &str = "foundry.dev/machine-cleanup";

/// Field manager / reporting component name used for API writes and events
pub const CONTROLLER_NAME: &str = "foundry-controller";

/// Key of the SSH private key inside the cluster's secret
pub const PRIVATE_KEY_SECRET_KEY: &str = "private-key";

/// Name of the secret holding the generated admin kubeconfig
pub const ADMIN_KUBECONFIG_SECRET: &str = "cluster-admin-kubeconfig";

/// Key of the kubeconfig document inside [`ADMIN_KUBECONFIG_SECRET`]
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";
