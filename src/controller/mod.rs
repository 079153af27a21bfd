//! FoundryMachine controller
//!
//! Every change to a machine, to its cluster or to the cluster's control
//! plane re-runs [`reconcile`] for the machines concerned. A dispatch reads
//! fresh records, asks the [`state`] machine for the next step and performs
//! it; long-running steps are handed to the [`runner`](crate::runner).

mod machine;
pub mod state;

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ReconcilerConfig;
use crate::crd::{FoundryCluster, FoundryMachine};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::provisioner::Provisioner;
use crate::remote::{RemoteExecutor, SshExecutor};
use crate::runner::OperationRegistry;
use crate::store::{KubeClient, KubeClientImpl};
use crate::CONTROLLER_NAME;

pub use machine::{error_policy, reconcile};
pub use state::{next_step, Step};

/// Controller context containing shared state and capabilities
///
/// Shared by every dispatch and every background operation. Build it with
/// [`ContextBuilder`]:
///
/// ```ignore
/// let ctx = Context::builder(client, Arc::new(MaasProvisioner::new(maas)?))
///     .config(ReconcilerConfig::default())
///     .build();
/// ```
pub struct Context {
    /// Record store (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Infrastructure provisioner
    pub provisioner: Arc<dyn Provisioner>,
    /// Remote command execution on machines
    pub executor: Arc<dyn RemoteExecutor>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Background operations in flight
    pub operations: OperationRegistry,
    /// Timings
    pub config: ReconcilerConfig,
    /// Cancelled when the controller stops; every operation token is a child
    pub shutdown: CancellationToken,
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, provisioner: Arc<dyn Provisioner>) -> ContextBuilder {
        ContextBuilder::new(client, provisioner)
    }

    /// Create a context from explicit capabilities (for testing)
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn RemoteExecutor>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self::from_parts(kube, provisioner, executor, events, config)
    }

    fn from_parts(
        kube: Arc<dyn KubeClient>,
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn RemoteExecutor>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            kube,
            provisioner,
            executor,
            events,
            operations: OperationRegistry::new(),
            config,
            shutdown: CancellationToken::new(),
            failures: DashMap::new(),
        }
    }

    /// Count one more consecutive retryable failure for `key`
    pub(crate) fn record_failure(&self, key: &str) -> u32 {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget the failures of `key` after a clean dispatch
    pub(crate) fn reset_backoff(&self, key: &str) {
        self.failures.remove(key);
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    provisioner: Arc<dyn Provisioner>,
    kube: Option<Arc<dyn KubeClient>>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ReconcilerConfig,
}

impl ContextBuilder {
    fn new(client: Client, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            client,
            provisioner,
            kube: None,
            executor: None,
            events: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Override the record store (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the remote executor
    pub fn executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the reconciler timings
    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SshExecutor::default()));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
        });
        Context::from_parts(kube, self.provisioner, executor, events, self.config)
    }
}

/// Machines of `cluster`, to re-dispatch when the cluster changes
pub fn machines_of_cluster(
    machines: &[Arc<FoundryMachine>],
    cluster: &FoundryCluster,
) -> Vec<ObjectRef<FoundryMachine>> {
    let namespace = cluster.namespace();
    let name = cluster.name_any();
    machines
        .iter()
        .filter(|m| m.namespace() == namespace && m.spec.cluster_ref == name)
        .map(|m| ObjectRef::from_obj(m.as_ref()))
        .collect()
}

/// Siblings of a control-plane machine, to re-dispatch when it changes
///
/// Workers wait on the control plane's address, phase and version; a change
/// to any other machine re-dispatches nothing extra.
pub fn dependents_of_control_plane(
    machines: &[Arc<FoundryMachine>],
    changed: &FoundryMachine,
) -> Vec<ObjectRef<FoundryMachine>> {
    if !changed.is_control_plane() {
        return Vec::new();
    }
    let namespace = changed.namespace();
    let name = changed.name_any();
    machines
        .iter()
        .filter(|m| m.namespace() == namespace && m.name_any() != name && !m.is_control_plane())
        .map(|m| ObjectRef::from_obj(m.as_ref()))
        .collect()
}

/// Run the FoundryMachine controller until a termination signal
///
/// Cancels every background operation on the way out.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let machines: Api<FoundryMachine> = Api::all(client.clone());
    let clusters: Api<FoundryCluster> = Api::all(client);

    let controller = Controller::new(machines.clone(), WatcherConfig::default());
    let cluster_index = controller.store();
    let machine_index = controller.store();

    info!("Starting FoundryMachine controller");
    controller
        .watches(clusters, WatcherConfig::default(), move |cluster| {
            machines_of_cluster(&cluster_index.state(), &cluster)
        })
        .watches(machines, WatcherConfig::default(), move |machine| {
            dependents_of_control_plane(&machine_index.state(), &machine)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => {
                    debug!(machine = %object.name, ?action, "Machine reconciliation completed");
                }
                Err(e) => {
                    error!(error = ?e, "Machine reconciliation error");
                }
            }
        })
        .await;

    info!(
        in_flight = ctx.operations.len(),
        "controller stopped, cancelling background operations"
    );
    ctx.shutdown.cancel();
}
