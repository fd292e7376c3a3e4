//! Error types for the regent operator

use thiserror::Error;

/// Main error type for regent operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for MemberGroup specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Member control-plane API error (health lookup, leader transfer)
    #[error("member control-plane error: {0}")]
    ControlPlane(String),

    /// A leader must move but no healthy member can take over
    #[error("no healthy transferee available for leader {leader}")]
    NoHealthyTransferee {
        /// Member currently holding leadership
        leader: String,
    },

    /// Optimistic-concurrency conflict on a write back
    #[error("conflict writing {0}: object was modified concurrently")]
    Conflict(String),

    /// A reconciliation pass ended in a failed task
    #[error("task {task} failed: {reason}")]
    TaskFailed {
        /// Name of the task that failed
        task: String,
        /// Operator-facing reason
        reason: String,
    },

    /// Controller configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a control-plane error with the given message
    pub fn control_plane(msg: impl Into<String>) -> Self {
        Self::ControlPlane(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns true if the error is an HTTP 409 from the API server
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Returns true if the error is an HTTP 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Returns true if the API server rejected the object as invalid (HTTP 422)
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 422)
    }

    /// Returns true if the API server reports the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::Kube(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::ControlPlane(e.to_string())
    }
}
