//! Kubernetes Event recording for the machine controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that phase changes and failures show up in `kubectl describe
//! foundrymachine` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (see [`reasons`])
    /// * `action` - What action was taken (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for when event recording is disabled.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A machine's phase changed
    pub const RESOURCE_STATE_CHANGE: &str = "ResourceStateChange";
    /// A record the machine depends on is missing
    pub const RESOURCE_FAILED: &str = "ResourceFailed";
    /// A background operation failed
    pub const OPERATION_FAILED: &str = "OperationFailed";
    /// A background operation exceeded its timeout
    pub const OPERATION_TIMED_OUT: &str = "OperationTimedOut";
    /// The cluster's control-plane machine could not be resolved
    pub const CONTROL_PLANE_MISSING: &str = "ControlPlaneMissing";
    /// The control-plane machine itself is being deleted
    pub const CONTROL_PLANE_DELETION: &str = "ControlPlaneDeletion";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Requesting infrastructure
    pub const PROVISION: &str = "Provision";
    /// Installing and joining the node
    pub const BOOTSTRAP: &str = "Bootstrap";
    /// Upgrading the node's Kubernetes version
    pub const UPGRADE: &str = "Upgrade";
    /// Draining and releasing the machine
    pub const DELETE: &str = "Delete";
}
