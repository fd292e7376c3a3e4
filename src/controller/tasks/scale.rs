//! Remove members above the desired replica count

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::info;

use crate::controller::context::ReconcileContext;
use crate::controller::leader::{pre_delete_check, PreDelete};
use crate::controller::Context;
use crate::events::{actions, reasons};
use crate::pod::{is_pod_ready, is_terminating};
use crate::task::{Task, TaskResult};

/// Deletes the highest ordinal at or above `replicas`, one per pass
///
/// The leader-safety check guards the deletion like any other destructive
/// pod action.
pub struct ScaleIn {
    shared: Arc<Context>,
}

impl ScaleIn {
    /// Create the task
    pub fn new(shared: Arc<Context>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Task<ReconcileContext> for ScaleIn {
    fn name(&self) -> &str {
        "ScaleIn"
    }

    async fn run(&self, ctx: &mut ReconcileContext) -> TaskResult {
        let replicas = ctx.replicas();
        let Some((&ordinal, pod)) = ctx.pods.range(replicas..).next_back() else {
            return TaskResult::complete("no members to remove");
        };
        let pod_name = ctx.group.pod_name(ordinal);

        if is_terminating(pod) {
            return TaskResult::wait(format!("waiting for {pod_name} to terminate"));
        }

        if ctx.is_healthy(ordinal) || is_pod_ready(pod) {
            match pre_delete_check(ctx, &self.shared, ordinal).await {
                Ok(PreDelete::Proceed) => {}
                Ok(PreDelete::TransferIssued(target)) => {
                    return TaskResult::wait(format!(
                        "waiting for leadership to move from {pod_name} to {target}"
                    ));
                }
                Err(e) => return TaskResult::fail(format!("can't remove {pod_name}: {e}")),
            }
        }

        info!(pod = %pod_name, replicas, "removing member above desired replicas");
        let namespace = ctx.group.namespace_or_default();
        if let Err(e) = self.shared.platform.delete_pod(&namespace, &pod_name).await {
            return TaskResult::fail(format!("can't delete pod {pod_name}: {e}"));
        }
        ctx.pod_mutated = true;
        self.shared
            .metrics
            .record_pod_action(&ctx.key(), "delete");
        self.shared
            .events
            .publish(
                &ctx.object_ref,
                EventType::Normal,
                reasons::MEMBER_REMOVED,
                actions::SCALE,
                Some(format!("deleted {pod_name} to scale to {replicas} replicas")),
            )
            .await;

        TaskResult::retry(format!("removed {pod_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{member, observed_pod, sample_group, snapshot_of, test_context};
    use crate::controller::MockPlatformClient;
    use crate::member::MockMemberControl;
    use crate::task::TaskKind;

    fn ctx_with(replicas: i32, pods: &[i32], members: MockMemberControl) -> ReconcileContext {
        let group = Arc::new(sample_group(replicas));
        let mut ctx = ReconcileContext::new(group.clone(), Arc::new(members), false);
        for &o in pods {
            ctx.pods.insert(o, observed_pod(&group, o, true));
        }
        ctx
    }

    #[tokio::test]
    async fn nothing_to_remove() {
        let mut ctx = ctx_with(3, &[0, 1, 2], MockMemberControl::new());
        let mut platform = MockPlatformClient::new();
        platform.expect_delete_pod().never();
        let result = ScaleIn::new(Arc::new(test_context(platform)))
            .run(&mut ctx)
            .await;
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn removes_highest_extra_ordinal_only() {
        let mut ctx = ctx_with(2, &[0, 1, 2, 3], MockMemberControl::new());
        ctx.snapshot = Some(snapshot_of(vec![
            member("pd-0", true, true),
            member("pd-3", true, false),
        ]));
        let mut platform = MockPlatformClient::new();
        platform
            .expect_delete_pod()
            .withf(|ns, name| ns == "tidb" && name == "pd-3")
            .times(1)
            .returning(|_, _| Ok(()));

        let result = ScaleIn::new(Arc::new(test_context(platform)))
            .run(&mut ctx)
            .await;
        assert_eq!(result.kind(), TaskKind::Retry);
        assert!(ctx.pod_mutated);
    }

    #[tokio::test]
    async fn leader_is_moved_before_removal() {
        let mut members = MockMemberControl::new();
        members
            .expect_transfer_leadership()
            .withf(|t| t == "pd-1")
            .times(1)
            .returning(|_| Ok(()));
        let mut ctx = ctx_with(2, &[0, 1, 2], members);
        ctx.snapshot = Some(snapshot_of(vec![
            member("pd-0", true, false),
            member("pd-1", true, false),
            member("pd-2", true, true),
        ]));
        let mut platform = MockPlatformClient::new();
        platform.expect_delete_pod().never();

        let result = ScaleIn::new(Arc::new(test_context(platform)))
            .run(&mut ctx)
            .await;
        assert_eq!(result.kind(), TaskKind::Wait);
        assert!(!ctx.pod_mutated);
    }
}
