//! Kubernetes Event recording for the MemberGroup controller
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! reconciliation pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a group
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What the controller did (see [`actions`])
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

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
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
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops everything
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

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A new template revision started rolling out
    pub const ROLL_STARTED: &str = "RollStarted";
    /// Every member runs the update revision
    pub const ROLL_COMPLETE: &str = "RollComplete";
    /// The update strategy hands the roll to the user
    pub const MANUAL_OVERRIDE: &str = "ManualStrategyOverride";
    /// Leadership moved off a member about to be disrupted
    pub const LEADER_TRANSFERRED: &str = "LeaderTransferred";
    /// Leader cannot be disrupted because no peer can take over
    pub const NO_HEALTHY_TRANSFEREE: &str = "NoHealthyTransferee";
    /// A member pod was deleted for recreation
    pub const POD_RECREATED: &str = "PodRecreated";
    /// A member pod was removed on scale-in
    pub const MEMBER_REMOVED: &str = "MemberRemoved";
    /// The spec failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// Standard reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Rolling upgrade step
    pub const UPGRADE: &str = "Upgrade";
    /// Leadership transfer
    pub const TRANSFER_LEADER: &str = "TransferLeader";
    /// Pod deletion
    pub const DELETE_POD: &str = "DeletePod";
    /// Scale-in
    pub const SCALE: &str = "Scale";
}
