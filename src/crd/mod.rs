//! Custom Resource Definitions for regent
//!
//! This module contains the MemberGroup CRD and its supporting types.

mod member_group;
mod types;

pub use member_group::{MemberGroup, MemberGroupSpec, MemberGroupStatus};
pub use types::{
    Condition, ConditionStatus, ConfigUpdateStrategy, GroupPhase, MemberStatus, MemberTemplate,
    ResourceSpec, RollingUpdateSpec, TlsSpec, UpdateStrategy, UpdateStrategyType, VolumeSpec,
    DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT,
};
