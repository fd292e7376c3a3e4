//! Bounded-staleness snapshot cache

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{HealthSnapshot, MemberControl};
use crate::Error;

/// Serves health snapshots from cache for up to `ttl`
///
/// `refresh()` and every leadership transfer drop the cached snapshot, so the
/// next read observes the control plane directly.
pub struct CachedMemberControl<M> {
    inner: M,
    ttl: Duration,
    cached: Mutex<Option<(Instant, HealthSnapshot)>>,
}

impl<M: MemberControl> CachedMemberControl<M> {
    /// Wrap `inner` with a cache of the given TTL
    pub fn new(inner: M, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// The wrapped client
    pub fn inner(&self) -> &M {
        &self.inner
    }

    fn fresh(&self) -> Option<HealthSnapshot> {
        let guard = self.cached.lock().ok()?;
        guard
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, snapshot)| snapshot.clone())
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            *guard = None;
        }
    }
}

#[async_trait]
impl<M: MemberControl> MemberControl for CachedMemberControl<M> {
    async fn health_snapshot(&self) -> Result<HealthSnapshot, Error> {
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }
        let snapshot = self.inner.health_snapshot().await?;
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some((Instant::now(), snapshot.clone()));
        }
        Ok(snapshot)
    }

    fn refresh(&self) {
        debug!("invalidating cached member health");
        self.invalidate();
        self.inner.refresh();
    }

    async fn transfer_leadership(&self, target: &str) -> Result<(), Error> {
        let result = self.inner.transfer_leadership(target).await;
        self.invalidate();
        result
    }
}
