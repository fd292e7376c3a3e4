//! Per-pass working state

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::Resource;

use crate::crd::{MemberGroup, MemberGroupStatus, MemberTemplate};
use crate::member::{HealthSnapshot, MemberControl, MemberHealth};
use crate::LABEL_REVISION;

/// Template, revision and config hash an ordinal is built from
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    /// Member template
    pub template: MemberTemplate,
    /// Revision hash of `template`
    pub hash: String,
    /// Hash of the canonical configuration in `template`
    pub config_hash: String,
}

/// Mutable state shared by the tasks of one reconciliation pass
///
/// Built fresh at the start of every pass from the group object; everything
/// that must survive the pass is written back through the group status.
pub struct ReconcileContext {
    /// Group being reconciled, as read at the start of the pass
    pub group: Arc<MemberGroup>,
    /// Reference used for Events
    pub object_ref: ObjectReference,
    /// Member control plane of this group
    pub members: Arc<dyn MemberControl>,
    /// Pod mutation is delegated to an admission webhook
    pub pod_webhook: bool,

    /// Observed pods by ordinal
    pub pods: BTreeMap<i32, Pod>,
    /// Latest health snapshot; `None` if the control plane could not be reached
    pub snapshot: Option<HealthSnapshot>,
    /// Why the snapshot is missing
    pub snapshot_error: Option<String>,

    /// Revision every member ran when the last roll finished
    pub current: Option<Revision>,
    /// Revision being rolled out
    pub update: Option<Revision>,
    /// Ordinals at or above this value get the update revision
    pub partition: i32,
    /// Replica count is changing; rolls are frozen
    pub scaling: bool,
    /// Update strategy hands pod replacement to the user
    pub manual_override: bool,
    /// A new roll started this pass
    pub roll_started: bool,
    /// A pod was created, updated or deleted this pass
    pub pod_mutated: bool,

    /// Status written back after the pass
    pub status: MemberGroupStatus,
}

impl ReconcileContext {
    /// Start a pass for `group`
    pub fn new(group: Arc<MemberGroup>, members: Arc<dyn MemberControl>, pod_webhook: bool) -> Self {
        let status = group.status.clone().unwrap_or_default();
        let object_ref = group.object_ref(&());
        Self {
            partition: status.partition.unwrap_or(0),
            object_ref,
            members,
            pod_webhook,
            pods: BTreeMap::new(),
            snapshot: None,
            snapshot_error: None,
            current: None,
            update: None,
            scaling: false,
            manual_override: false,
            roll_started: false,
            pod_mutated: false,
            status,
            group,
        }
    }

    /// Desired replica count
    pub fn replicas(&self) -> i32 {
        self.group.spec.replicas.max(0)
    }

    /// Observed pod for `ordinal`
    pub fn pod(&self, ordinal: i32) -> Option<&Pod> {
        self.pods.get(&ordinal)
    }

    /// Revision label of the pod for `ordinal`
    pub fn pod_revision(&self, ordinal: i32) -> Option<&str> {
        self.pod(ordinal)?
            .metadata
            .labels
            .as_ref()?
            .get(LABEL_REVISION)
            .map(String::as_str)
    }

    /// Snapshot entry for `ordinal`
    ///
    /// Members register under their member name; the plain pod name is accepted
    /// as well.
    pub fn member(&self, ordinal: i32) -> Option<&MemberHealth> {
        let snapshot = self.snapshot.as_ref()?;
        snapshot
            .get(&self.group.member_name(ordinal))
            .or_else(|| snapshot.get(&self.group.pod_name(ordinal)))
    }

    /// Last known health of `ordinal`; unknown counts as unhealthy
    pub fn is_healthy(&self, ordinal: i32) -> bool {
        self.member(ordinal).is_some_and(|m| m.health)
    }

    /// Whether `ordinal` holds leadership in the latest snapshot
    pub fn is_leader(&self, ordinal: i32) -> bool {
        self.member(ordinal).is_some_and(|m| {
            m.is_leader
                || self
                    .snapshot
                    .as_ref()
                    .is_some_and(|s| s.is_leader(&m.name))
        })
    }

    /// Revision `ordinal` is eligible for
    ///
    /// Under a manual override every recreated pod gets the update revision;
    /// otherwise only ordinals at or above the partition do.
    pub fn eligible_revision(&self, ordinal: i32) -> Option<&Revision> {
        if self.manual_override || ordinal >= self.partition {
            self.update.as_ref()
        } else {
            self.current.as_ref()
        }
    }

    /// Existing pod below the partition that must not be disrupted
    ///
    /// Ordinals below the partition are closed to the roll. Whatever revision
    /// their pod runs, including one left over from a superseded roll, it is
    /// kept until the partition opens the ordinal. Missing pods are still
    /// created.
    pub fn is_held(&self, ordinal: i32) -> bool {
        !self.manual_override && ordinal < self.partition && self.pods.contains_key(&ordinal)
    }

    /// `namespace/name` of the group
    pub fn key(&self) -> String {
        self.group.key()
    }
}
