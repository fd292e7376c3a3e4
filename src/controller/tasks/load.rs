//! Observe pods and member health

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::controller::context::ReconcileContext;
use crate::controller::Context;
use crate::pod::group_selector;
use crate::task::{Task, TaskResult};
use crate::LABEL_ORDINAL;

/// Lists the group's pods and fetches the (possibly cached) health snapshot
///
/// An unreachable control plane does not stop the pass: creating missing
/// members still has to work before the control plane is up. Tasks that need
/// leadership information treat a missing snapshot as unsafe.
pub struct LoadContext {
    shared: Arc<Context>,
}

impl LoadContext {
    /// Create the task
    pub fn new(shared: Arc<Context>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Task<ReconcileContext> for LoadContext {
    fn name(&self) -> &str {
        "LoadContext"
    }

    async fn run(&self, ctx: &mut ReconcileContext) -> TaskResult {
        let namespace = ctx.group.namespace_or_default();
        let pods = match self
            .shared
            .platform
            .list_pods(&namespace, &group_selector(&ctx.group))
            .await
        {
            Ok(pods) => pods,
            Err(e) => return TaskResult::fail(format!("can't list pods: {e}")),
        };

        ctx.pods.clear();
        for pod in pods {
            let ordinal = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_ORDINAL))
                .and_then(|o| o.parse::<i32>().ok())
                .or_else(|| ctx.group.ordinal_of(pod.metadata.name.as_deref().unwrap_or_default()));
            match ordinal {
                Some(ordinal) if ordinal >= 0 => {
                    ctx.pods.insert(ordinal, pod);
                }
                _ => debug!(pod = ?pod.metadata.name, "ignoring pod without an ordinal"),
            }
        }

        match ctx.members.health_snapshot().await {
            Ok(snapshot) => {
                ctx.snapshot = Some(snapshot);
                ctx.snapshot_error = None;
            }
            Err(e) => {
                warn!(error = %e, "member health unavailable");
                ctx.snapshot = None;
                ctx.snapshot_error = Some(e.to_string());
            }
        }

        TaskResult::complete(format!("observed {} pods", ctx.pods.len()))
    }
}
