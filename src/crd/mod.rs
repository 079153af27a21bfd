//! Custom Resource Definitions for Foundry
//!
//! This module contains all CRD definitions used by the Foundry operator.

mod cluster;
mod machine;
mod types;

pub use cluster::{FoundryCluster, FoundryClusterSpec, FoundryClusterStatus};
pub use machine::{
    FoundryMachine, FoundryMachineSpec, FoundryMachineStatus, HOSTNAME_ANNOTATION, IP_ANNOTATION,
    SYSTEM_ID_ANNOTATION,
};
pub use types::{ClusterPhase, MachineErrorReason, MachinePhase, MachineRole, SshConfig};
