//! Member control-plane client
//!
//! The controller consumes the member service's own control API through the
//! [`MemberControl`] trait: a health/leadership snapshot that may be served
//! from a bounded-staleness cache, an explicit `refresh()` that drops that
//! cache, and a leadership transfer.
//!
//! - [`HttpMemberControl`] talks to the member API over HTTP(S)
//! - [`CachedMemberControl`] puts a TTL cache in front of any client
//! - [`ClientRegistry`] hands out one cached client per group

mod cache;
mod http;
mod registry;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use cache::CachedMemberControl;
pub use http::HttpMemberControl;
pub use registry::{ClientRegistry, MemberControlFactory};
#[cfg(test)]
pub use registry::MockMemberControlFactory;

/// Health and leadership of one member as reported by the control plane
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberHealth {
    /// Name the member registered with
    pub name: String,
    /// Control-plane member id
    pub id: u64,
    /// Member answers health checks
    pub health: bool,
    /// Member holds leadership
    pub is_leader: bool,
}

/// Point-in-time view of every member the control plane knows about
///
/// May be stale by up to the cache TTL of the client that produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Members keyed by name
    pub members: BTreeMap<String, MemberHealth>,
    /// Name of the current leader, if any
    pub leader: Option<String>,
}

impl HealthSnapshot {
    /// Build a snapshot from member entries; leadership is taken from the entries
    pub fn from_members(members: impl IntoIterator<Item = MemberHealth>) -> Self {
        let members: BTreeMap<_, _> = members.into_iter().map(|m| (m.name.clone(), m)).collect();
        let leader = members
            .values()
            .find(|m| m.is_leader)
            .map(|m| m.name.clone());
        Self { members, leader }
    }

    /// Look up a member by name
    pub fn get(&self, name: &str) -> Option<&MemberHealth> {
        self.members.get(name)
    }

    /// Returns true if `name` is known and healthy
    pub fn is_healthy(&self, name: &str) -> bool {
        self.get(name).is_some_and(|m| m.health)
    }

    /// Returns true if `name` currently holds leadership
    pub fn is_leader(&self, name: &str) -> bool {
        self.leader.as_deref() == Some(name)
    }

    /// Every member other than `name`, in name order
    pub fn peers_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MemberHealth> + 'a {
        self.members.values().filter(move |m| m.name != name)
    }
}

/// Operations the controller needs from a member group's control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberControl: Send + Sync {
    /// Current health and leadership of every member
    async fn health_snapshot(&self) -> Result<HealthSnapshot, Error>;

    /// Drop any cached snapshot so the next read goes to the control plane
    fn refresh(&self);

    /// Ask the current leader to hand leadership to `target`
    async fn transfer_leadership(&self, target: &str) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, health: bool, is_leader: bool) -> MemberHealth {
        MemberHealth {
            name: name.to_string(),
            id: 0,
            health,
            is_leader,
        }
    }

    #[test]
    fn snapshot_indexes_members_and_leader() {
        let snapshot = HealthSnapshot::from_members([
            member("pd-0", true, false),
            member("pd-1", false, false),
            member("pd-2", true, true),
        ]);

        assert_eq!(snapshot.leader.as_deref(), Some("pd-2"));
        assert!(snapshot.is_leader("pd-2"));
        assert!(!snapshot.is_leader("pd-0"));
        assert!(snapshot.is_healthy("pd-0"));
        assert!(!snapshot.is_healthy("pd-1"));
        assert!(!snapshot.is_healthy("pd-9"));

        let peers: Vec<_> = snapshot.peers_of("pd-1").map(|m| m.name.as_str()).collect();
        assert_eq!(peers, vec!["pd-0", "pd-2"]);
    }
}
