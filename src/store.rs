//! Record store access
//!
//! All reads and writes of machine, cluster and secret records go through the
//! [`KubeClient`] trait so the controller and workflows can be tested against
//! mocks or an in-memory store. Writes use the record's resourceVersion; a
//! stale write surfaces as [`Error::Conflict`] and [`patch_machine`] retries it
//! against a fresh read.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{FoundryCluster, FoundryMachine};
use crate::error::{is_conflict, LookupFailure};
use crate::{Error, CONTROLLER_NAME};

/// Number of read-modify-write rounds before a conflicting write gives up
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Trait abstracting record store operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a machine, `None` if it does not exist
    async fn get_machine(&self, namespace: &str, name: &str)
        -> Result<Option<FoundryMachine>, Error>;

    /// List all machines in a namespace
    async fn list_machines(&self, namespace: &str) -> Result<Vec<FoundryMachine>, Error>;

    /// Resolve the single control-plane machine of a namespace
    ///
    /// Fails with [`Error::ControlPlaneLookup`] when there is none or more
    /// than one.
    async fn find_control_plane(&self, namespace: &str) -> Result<FoundryMachine, Error>;

    /// Write a machine's metadata, spec and status
    ///
    /// The write is conditional on `metadata.resourceVersion`; a stale
    /// version fails with [`Error::Conflict`]. Returns the stored record.
    async fn replace_machine(&self, machine: &FoundryMachine) -> Result<FoundryMachine, Error>;

    /// Fetch a cluster, `None` if it does not exist
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<FoundryCluster>, Error>;

    /// Fetch a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a secret, replacing it if one with the same name exists
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;
}

/// Pick the control-plane machine out of a namespace's machines
pub fn select_control_plane(
    namespace: &str,
    machines: Vec<FoundryMachine>,
) -> Result<FoundryMachine, Error> {
    let mut control_planes: Vec<FoundryMachine> = machines
        .into_iter()
        .filter(|m| m.is_control_plane())
        .collect();

    match control_planes.len() {
        0 => Err(Error::control_plane_lookup(namespace, LookupFailure::NotFound)),
        1 => Ok(control_planes.remove(0)),
        count => Err(Error::control_plane_lookup(
            namespace,
            LookupFailure::Ambiguous { count },
        )),
    }
}

/// Read-modify-write a machine with optimistic concurrency
///
/// Fetches the current record, applies `mutate`, stamps `lastUpdated` and
/// writes it back. A conflicting write is retried against a fresh read up to
/// [`MAX_WRITE_ATTEMPTS`] times, so concurrent writers never clobber each
/// other's fields. Returns `None` if the machine no longer exists.
pub async fn patch_machine<F>(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<FoundryMachine>, Error>
where
    F: FnMut(&mut FoundryMachine) + Send,
{
    patch_machine_if(kube, namespace, name, |m| {
        mutate(m);
        true
    })
    .await
}

/// [`patch_machine`] where `mutate` may decline the write
///
/// `mutate` sees every fresh read, including the ones after a conflict; when
/// it returns `false` nothing is written and `None` is returned.
pub async fn patch_machine_if<F>(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<FoundryMachine>, Error>
where
    F: FnMut(&mut FoundryMachine) -> bool + Send,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let Some(mut machine) = kube.get_machine(namespace, name).await? else {
            debug!(machine = %name, "machine vanished before status write");
            return Ok(None);
        };

        if !mutate(&mut machine) {
            debug!(machine = %name, "status write declined");
            return Ok(None);
        }
        machine.status_mut().last_updated = Some(chrono::Utc::now());

        match kube.replace_machine(&machine).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(Error::Conflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                debug!(machine = %name, attempt, "write conflict, re-reading machine");
            }
            Err(e) => {
                warn!(machine = %name, attempt, error = %e, "failed to write machine");
                return Err(e);
            }
        }
    }
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }
}

/// Map a kube write error, turning 409 into [`Error::Conflict`]
fn write_error(kind: &str, name: &str, err: kube::Error) -> Error {
    if is_conflict(&err) {
        Error::conflict(kind, name)
    } else {
        err.into()
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<FoundryMachine>, Error> {
        let api: Api<FoundryMachine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<FoundryMachine>, Error> {
        let api: Api<FoundryMachine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn find_control_plane(&self, namespace: &str) -> Result<FoundryMachine, Error> {
        let machines = self.list_machines(namespace).await?;
        select_control_plane(namespace, machines)
    }

    async fn replace_machine(&self, machine: &FoundryMachine) -> Result<FoundryMachine, Error> {
        let namespace = machine.namespace().unwrap_or_default();
        let name = machine.name_any();
        let api: Api<FoundryMachine> = Api::namespaced(self.client.clone(), &namespace);
        let pp = Self::post_params();

        let stored = api
            .replace(&name, &pp, machine)
            .await
            .map_err(|e| write_error("FoundryMachine", &name, e))?;

        // Removing the last finalizer of a deleted record lets the API server
        // remove it; there is no status left to write.
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            return Ok(stored);
        }

        let mut with_status = stored.clone();
        with_status.status = machine.status.clone();
        let body = serde_json::to_vec(&with_status)
            .map_err(|e| Error::serialization_for_kind("FoundryMachine", e.to_string()))?;

        api.replace_status(&name, &pp, body)
            .await
            .map_err(|e| write_error("FoundryMachine", &name, e))
    }

    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<FoundryCluster>, Error> {
        let api: Api<FoundryCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let pp = Self::post_params();

        match api.create(&pp, secret).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(secret = %name, "secret exists, replacing");
                let existing = api.get(&name).await?;
                let mut replacement = secret.clone();
                replacement.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &pp, &replacement)
                    .await
                    .map_err(|e| write_error("Secret", &name, e))?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
