//! MemberGroup Custom Resource Definition
//!
//! A MemberGroup declares a set of ordinally numbered consensus members.
//! Member `n` runs in pod `<group>-<n>`; the operator keeps each pod on the
//! template it is eligible for and rolls new templates out one ordinal at a
//! time, highest ordinal first.

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ConfigUpdateStrategy, GroupPhase, MemberStatus, MemberTemplate, TlsSpec,
    UpdateStrategy,
};
use crate::Error;

/// Specification for a MemberGroup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "regent.dev",
    version = "v1alpha1",
    kind = "MemberGroup",
    plural = "membergroups",
    shortname = "mg",
    status = "MemberGroupStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Leader","type":"string","jsonPath":".status.leader"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MemberGroupSpec {
    /// Desired number of members
    pub replicas: i32,

    /// Pod template for every member
    pub template: MemberTemplate,

    /// How template changes are rolled out
    #[serde(default)]
    pub update_strategy: UpdateStrategy,

    /// How configuration-only changes are applied
    #[serde(default)]
    pub config_update_strategy: ConfigUpdateStrategy,

    /// Cluster TLS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    /// Cluster DNS domain; when set, members are addressed by FQDN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,

    /// Stop reconciling this group
    #[serde(default)]
    pub paused: bool,
}

impl MemberGroupSpec {
    /// Returns true if cluster TLS is enabled
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }

    /// Validate the group specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.replicas < 0 {
            return Err(Error::validation(format!(
                "replicas must be non-negative, got {}",
                self.replicas
            )));
        }

        let template = &self.template;
        if template.image.trim().is_empty() {
            return Err(Error::validation("template.image must not be empty"));
        }
        if template.version.trim().is_empty() {
            return Err(Error::validation("template.version must not be empty"));
        }
        for (field, port) in [
            ("clientPort", template.client_port),
            ("peerPort", template.peer_port),
        ] {
            if !(1..=65535).contains(&port) {
                return Err(Error::validation(format!(
                    "template.{field} must be between 1 and 65535, got {port}"
                )));
            }
        }
        if template.client_port == template.peer_port {
            return Err(Error::validation(
                "template.clientPort and template.peerPort must differ",
            ));
        }

        let mut seen = HashSet::new();
        for vol in &template.volumes {
            if vol.name.trim().is_empty() || vol.path.trim().is_empty() {
                return Err(Error::validation("volumes need a name and a path"));
            }
            if !seen.insert(vol.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate volume name '{}'",
                    vol.name
                )));
            }
        }

        if let Some(partition) = self
            .update_strategy
            .rolling_update
            .as_ref()
            .and_then(|r| r.partition)
        {
            if partition < 0 || partition > self.replicas {
                return Err(Error::validation(format!(
                    "partition {partition} must be within 0..={}",
                    self.replicas
                )));
            }
        }

        Ok(())
    }
}

/// Status for a MemberGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberGroupStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: GroupPhase,

    /// Number of member pods that exist
    #[serde(default)]
    pub replicas: i32,

    /// Number of member pods that are ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Number of members running the update revision
    #[serde(default)]
    pub updated_replicas: i32,

    /// Revision every member ran when the last roll finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    /// Revision being rolled out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,

    /// Template matching `current_revision`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_template: Option<MemberTemplate>,

    /// Template matching `update_revision`; kept while a roll is in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_template: Option<MemberTemplate>,

    /// Ordinals at or above this value are eligible for the update revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,

    /// Replica count the group last fully converged to; differs from
    /// `spec.replicas` while the group is scaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_replicas: Option<i32>,

    /// Member currently holding leadership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,

    /// Per-member health and leadership
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberStatus>,

    /// Conditions representing the group state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Human-readable message about the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MemberGroupStatus {
    /// Replace the condition of the same type, keeping its timestamp if unchanged
    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            if !existing.same_state(&condition) {
                *existing = condition;
            }
            return;
        }
        self.conditions.push(condition);
    }
}

impl MemberGroup {
    /// Namespace of the group; MemberGroup is namespaced so this is always set
    /// for objects read from the API server
    pub fn namespace_or_default(&self) -> String {
        self.metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Name of the group
    pub fn group_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Name of the pod backing `ordinal`
    pub fn pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.group_name(), ordinal)
    }

    /// Name of the headless service members use for peer DNS
    pub fn peer_service_name(&self) -> String {
        format!("{}-peer", self.group_name())
    }

    /// Name the member for `ordinal` registers with the control plane
    ///
    /// Plain pod name, or the pod FQDN when a cluster domain is configured.
    pub fn member_name(&self, ordinal: i32) -> String {
        match self.spec.cluster_domain.as_deref().filter(|d| !d.is_empty()) {
            Some(domain) => format!(
                "{}.{}.{}.svc.{}",
                self.pod_name(ordinal),
                self.peer_service_name(),
                self.namespace_or_default(),
                domain
            ),
            None => self.pod_name(ordinal),
        }
    }

    /// Base URL of the member control API for this group
    pub fn control_plane_url(&self) -> String {
        let scheme = if self.spec.tls_enabled() { "https" } else { "http" };
        format!(
            "{}://{}-client.{}.svc:{}",
            scheme,
            self.group_name(),
            self.namespace_or_default(),
            self.spec.template.client_port
        )
    }

    /// `namespace/name` key used for logs, metrics and per-object state
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.group_name())
    }

    /// Lowest ordinal a roll may reach, from `updateStrategy.rollingUpdate.partition`
    pub fn partition_floor(&self) -> i32 {
        self.spec
            .update_strategy
            .rolling_update
            .as_ref()
            .and_then(|r| r.partition)
            .unwrap_or(0)
            .clamp(0, self.spec.replicas.max(0))
    }

    /// Parse the ordinal out of a pod or member name belonging to this group
    pub fn ordinal_of(&self, name: &str) -> Option<i32> {
        let prefix = format!("{}-", self.group_name());
        let rest = name.strip_prefix(&prefix)?;
        let digits = rest.split('.').next()?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}
