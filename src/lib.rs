//! Regent - Kubernetes operator for leader-elected consensus member groups
//!
//! Regent keeps every member of a replicated, leader-elected metadata service
//! on its declared template and version while never taking the elected leader
//! down without first moving leadership to a healthy peer.
//!
//! # Architecture
//!
//! One reconciliation pass runs per `MemberGroup`. The pass is an ordered
//! [`task::Pipeline`] of idempotent tasks; each returns a tagged
//! [`task::TaskResult`] and the first non-`Complete` result ends the pass.
//! Rolling upgrades step a partition boundary down one ordinal per pass,
//! highest ordinal first, and every destructive pod action goes through a
//! leader-safety check first.
//!
//! # Modules
//!
//! - [`crd`] - MemberGroup custom resource
//! - [`task`] - Task/Result/Pipeline abstraction
//! - [`controller`] - Reconciliation pass, tasks, and kube-runtime glue
//! - [`pod`] - Member pod manifests and pod comparison
//! - [`member`] - Member control-plane client (health, leadership transfer)
//! - [`hash`] - Content hashing for change detection
//! - [`backoff`] - Retry and requeue backoff
//! - [`config`] - Controller configuration
//! - [`events`] - Kubernetes Event publishing
//! - [`telemetry`] - Tracing and metrics setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod backoff;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod hash;
pub mod member;
pub mod pod;
pub mod task;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels and names
// =============================================================================

/// Label carrying the owning MemberGroup name
pub const LABEL_GROUP: &str = "regent.dev/group";

/// Label carrying the member ordinal
pub const LABEL_ORDINAL: &str = "regent.dev/ordinal";

/// Label carrying the member instance (pod) name
pub const LABEL_INSTANCE: &str = "regent.dev/instance";

/// Standard managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on everything regent creates
pub const MANAGED_BY: &str = "regent";

/// Label carrying the configuration content hash; used only for change detection
pub const LABEL_CONFIG_HASH: &str = "regent.dev/config-hash";

/// Label carrying the template revision a pod was built from
pub const LABEL_REVISION: &str = "controller-revision-hash";

/// Label carrying the hash of pod fields that cannot change without a restart
pub const LABEL_SPEC_HASH: &str = "regent.dev/pod-spec-hash";

/// Label carrying the hash of pod fields that can be updated in place
pub const LABEL_UPDATE_HASH: &str = "regent.dev/pod-update-hash";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "regent-controller";
