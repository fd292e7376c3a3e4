//! Tasks of the MemberGroup reconciliation pipeline
//!
//! Run in this order on every pass:
//!
//! 1. [`LoadContext`] - observe pods and member health
//! 2. [`ResolveRevisions`] - compute current/update revisions and the partition
//! 3. [`ScaleIn`] - remove members above the replica count
//! 4. [`RollingUpgrade`] - step the partition, moving leadership first
//! 5. [`MemberResources`] - per-ordinal ConfigMaps and claims
//! 6. [`Pods`] - create, patch or recreate at most one pod

mod load;
mod pods;
mod resources;
mod revision;
mod scale;
mod upgrade;

use std::sync::Arc;

pub use load::LoadContext;
pub use pods::Pods;
pub use resources::MemberResources;
pub use revision::ResolveRevisions;
pub use scale::ScaleIn;
pub use upgrade::RollingUpgrade;

use super::context::ReconcileContext;
use super::Context;
use crate::task::Pipeline;

/// The full reconciliation pipeline over `shared` dependencies
pub fn build_pipeline(shared: Arc<Context>) -> Pipeline<ReconcileContext> {
    Pipeline::new()
        .with(LoadContext::new(shared.clone()))
        .with(ResolveRevisions)
        .with(ScaleIn::new(shared.clone()))
        .with(RollingUpgrade::new(shared.clone()))
        .with(MemberResources::new(shared.clone()))
        .with(Pods::new(shared))
}
