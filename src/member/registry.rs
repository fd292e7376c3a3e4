//! Per-group member control clients

use std::sync::Arc;

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use super::{CachedMemberControl, HttpMemberControl, MemberControl};
use crate::config::ControllerConfig;
use crate::crd::MemberGroup;
use crate::Error;

/// Hands out the member control client for a group
#[cfg_attr(test, automock)]
pub trait MemberControlFactory: Send + Sync {
    /// Client for `group`'s control plane
    fn for_group(&self, group: &MemberGroup) -> Result<Arc<dyn MemberControl>, Error>;

    /// Drop whatever is held for the group `namespace/name`
    fn forget(&self, _namespace: &str, _name: &str) {}
}

struct Registered {
    endpoint: String,
    client: Arc<dyn MemberControl>,
}

/// Caches one [`CachedMemberControl`] per group
///
/// The entry remembers the endpoint it was built for. Changing ports or
/// toggling TLS replaces it with a fresh client (and an empty snapshot cache),
/// and [`MemberControlFactory::forget`] removes it once the group is gone.
pub struct ClientRegistry {
    clients: DashMap<String, Registered>,
    config: ControllerConfig,
    ca_bundle: Option<Vec<u8>>,
}

impl ClientRegistry {
    /// Create a registry; the CA bundle, if configured, is read once here
    pub fn new(config: ControllerConfig) -> Result<Self, Error> {
        let ca_bundle = match &config.ca_bundle {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                Error::config(format!("reading CA bundle {}: {e}", path.display()))
            })?),
            None => None,
        };
        Ok(Self {
            clients: DashMap::new(),
            config,
            ca_bundle,
        })
    }

    /// Number of cached clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no client is cached
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl MemberControlFactory for ClientRegistry {
    fn for_group(&self, group: &MemberGroup) -> Result<Arc<dyn MemberControl>, Error> {
        let key = group.key();
        let url = group.control_plane_url();
        let tls = group.spec.tls_enabled();
        let endpoint = format!("{url} tls={tls}");

        if let Some(registered) = self.clients.get(&key) {
            if registered.endpoint == endpoint {
                return Ok(registered.client.clone());
            }
        }

        let ca = if tls { self.ca_bundle.as_deref() } else { None };
        let http = HttpMemberControl::new(
            url,
            self.config.control_plane_timeout(),
            ca,
            self.config.control_plane_retry(),
        )?;
        let client: Arc<dyn MemberControl> =
            Arc::new(CachedMemberControl::new(http, self.config.snapshot_ttl()));

        let previous = self.clients.insert(
            key.clone(),
            Registered {
                endpoint: endpoint.clone(),
                client: client.clone(),
            },
        );
        match previous {
            Some(old) => debug!(
                key = %key,
                from = %old.endpoint,
                to = %endpoint,
                "member endpoint changed, replaced client"
            ),
            None => debug!(key = %key, endpoint = %endpoint, "created member control client"),
        }
        Ok(client)
    }

    fn forget(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        if self.clients.remove(&key).is_some() {
            debug!(key = %key, "dropped member control client");
        }
    }
}
