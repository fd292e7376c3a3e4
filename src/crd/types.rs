//! Supporting types for the MemberGroup CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default port members serve their client and control API on
pub const DEFAULT_CLIENT_PORT: i32 = 2379;

/// Default port members use for peer (consensus) traffic
pub const DEFAULT_PEER_PORT: i32 = 2380;

fn default_client_port() -> i32 {
    DEFAULT_CLIENT_PORT
}

fn default_peer_port() -> i32 {
    DEFAULT_PEER_PORT
}

/// Everything that ends up in a member's pod
///
/// Two templates that serialize identically produce the same revision hash.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberTemplate {
    /// Container image repository, without tag
    pub image: String,

    /// Binary version, used as the image tag
    pub version: String,

    /// Runtime configuration file content
    #[serde(default)]
    pub config: String,

    /// Port for client traffic and the member control API
    #[serde(default = "default_client_port")]
    pub client_port: i32,

    /// Port for peer traffic
    #[serde(default = "default_peer_port")]
    pub peer_port: i32,

    /// Compute resources for the member container
    #[serde(default, skip_serializing_if = "ResourceSpec::is_empty")]
    pub resources: ResourceSpec,

    /// Persistent volumes mounted into each member
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,

    /// Node selector for member pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Extra labels stamped on member pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations stamped on member pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl MemberTemplate {
    /// Image reference including the version tag
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

/// Compute resources, expressed as Kubernetes quantities
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request and limit (e.g. "2", "500m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory request and limit (e.g. "4Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceSpec {
    /// Returns true if no resources are set
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Persistent volume mounted into every member
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Volume name, unique within the template
    pub name: String,

    /// Mount path inside the container
    pub path: String,

    /// Requested storage size (e.g. "20Gi")
    pub storage: String,

    /// Storage class for the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// How pods pick up a new template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategyType {
    /// The operator steps the partition one ordinal at a time
    #[default]
    RollingUpdate,
    /// Pods are only replaced when deleted externally; the operator stands aside
    OnDelete,
}

/// Rolling update knobs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateSpec {
    /// Lowest ordinal the operator may roll to; ordinals below it stay on the
    /// current revision until the value is lowered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

/// Update strategy for the group
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// Strategy type
    #[serde(rename = "type", default)]
    pub type_: UpdateStrategyType,

    /// Rolling update settings; removing them hands the roll to the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateSpec>,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            type_: UpdateStrategyType::RollingUpdate,
            rolling_update: Some(RollingUpdateSpec::default()),
        }
    }
}

impl UpdateStrategy {
    /// Returns true if someone has taken the roll out of the operator's hands
    pub fn is_manual_override(&self) -> bool {
        self.type_ == UpdateStrategyType::OnDelete || self.rolling_update.is_none()
    }
}

/// How configuration changes reach running members
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConfigUpdateStrategy {
    /// Restart (recreate) members to apply new configuration
    #[default]
    RollingUpdate,
    /// Update the pod in place and let the member reload its configuration
    InPlace,
}

/// Cluster TLS settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Enable mutual TLS between members
    #[serde(default)]
    pub enabled: bool,

    /// Secret holding the member certificate; defaults to `<group>-cluster-secret`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Mount the cluster client certificate as well
    #[serde(default)]
    pub mount_client_secret: bool,

    /// Secret holding the client certificate; defaults to `<group>-cluster-client-secret`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_name: Option<String>,
}

/// Lifecycle phase of a MemberGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GroupPhase {
    /// All members run the current template
    #[default]
    Normal,
    /// A rolling upgrade is in flight
    Upgrading,
    /// Members are being added or removed
    Scaling,
    /// The last pass failed
    Failed,
}

impl std::fmt::Display for GroupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Scaling => write!(f, "Scaling"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed state of one member
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Member name as reported by the control plane
    pub name: String,

    /// Ordinal within the group
    pub ordinal: i32,

    /// Health as of the last snapshot
    pub health: bool,

    /// Leadership as of the last snapshot
    pub is_leader: bool,

    /// Revision of the member's pod, if it exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Synced)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Returns true if status, reason and message all match
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_override_detection() {
        assert!(!UpdateStrategy::default().is_manual_override());

        let on_delete = UpdateStrategy {
            type_: UpdateStrategyType::OnDelete,
            rolling_update: Some(RollingUpdateSpec::default()),
        };
        assert!(on_delete.is_manual_override());

        let no_policy = UpdateStrategy {
            type_: UpdateStrategyType::RollingUpdate,
            rolling_update: None,
        };
        assert!(no_policy.is_manual_override());
    }

    #[test]
    fn template_defaults_fill_ports() {
        let template: MemberTemplate = serde_json::from_value(serde_json::json!({
            "image": "registry.local/member",
            "version": "v8.1.0"
        }))
        .unwrap();
        assert_eq!(template.client_port, DEFAULT_CLIENT_PORT);
        assert_eq!(template.peer_port, DEFAULT_PEER_PORT);
        assert_eq!(template.image_ref(), "registry.local/member:v8.1.0");
        assert!(template.resources.is_empty());
    }

    #[test]
    fn condition_same_state_ignores_timestamp() {
        let a = Condition::new("Synced", ConditionStatus::True, "Complete", "ok");
        let mut b = a.clone();
        b.last_transition_time = a.last_transition_time - chrono::Duration::minutes(5);
        assert!(a.same_state(&b));
        b.message = "different".to_string();
        assert!(!a.same_state(&b));
    }
}
