//! Integration tests for the Foundry operator
//!
//! These tests require a Kubernetes cluster (kind) and tell the story of how
//! platform operators interact with Foundry records through the API server.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading, updating and deleting
//!   FoundryCluster and FoundryMachine resources, including the status
//!   subresource and the cleanup finalizer
//!
//! # Running These Tests
//!
//! ```bash
//! kind create cluster --name foundry-integration-test
//! cargo test --test kind -- --ignored
//! ```

mod crd_operations;
mod helpers;
