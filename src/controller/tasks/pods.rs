//! Pod reconciliation

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crate::controller::context::ReconcileContext;
use crate::controller::leader::{pre_delete_check, PreDelete};
use crate::controller::Context;
use crate::crd::ConfigUpdateStrategy;
use crate::events::{actions, reasons};
use crate::pod::{build_member_pod, compare_pods, is_pod_ready, is_terminating, PodComparison};
use crate::task::{Task, TaskResult};
use crate::LABEL_CONFIG_HASH;

fn config_hash_label(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(LABEL_CONFIG_HASH)
        .map(String::as_str)
}

/// Brings every member pod to the manifest of the revision it is eligible for
///
/// Ordinals are visited from the highest down and the task stops after the
/// first pod it creates, patches or deletes, so a pass touches at most one pod.
/// A missing pod whose member still looks healthy is not recreated until a
/// fresh health snapshot says otherwise. Existing pods below the partition are
/// never touched, and neither is any existing pod under a manual update
/// strategy or when an admission webhook owns pod mutation.
pub struct Pods {
    shared: Arc<Context>,
}

impl Pods {
    /// Create the task
    pub fn new(shared: Arc<Context>) -> Self {
        Self { shared }
    }

    async fn create(&self, ctx: &mut ReconcileContext, ordinal: i32, expected: &Pod) -> TaskResult {
        let pod_name = ctx.group.pod_name(ordinal);
        if ctx.is_healthy(ordinal) {
            ctx.members.refresh();
            return TaskResult::wait(format!(
                "{pod_name} is missing but its member still reports healthy"
            ));
        }

        info!(pod = %pod_name, "creating member pod");
        if let Err(e) = self.shared.platform.apply_pod(expected).await {
            return TaskResult::fail(format!("can't create pod {pod_name}: {e}"));
        }
        ctx.pod_mutated = true;
        self.shared.metrics.record_pod_action(&ctx.key(), "create");
        TaskResult::complete(format!("created {pod_name}"))
    }

    async fn recreate(&self, ctx: &mut ReconcileContext, ordinal: i32, why: &str) -> TaskResult {
        let pod_name = ctx.group.pod_name(ordinal);
        let ready = ctx.pod(ordinal).is_some_and(is_pod_ready);

        if ctx.is_healthy(ordinal) || ready {
            match pre_delete_check(ctx, &self.shared, ordinal).await {
                Ok(PreDelete::Proceed) => {}
                Ok(PreDelete::TransferIssued(target)) => {
                    return TaskResult::wait(format!(
                        "waiting for leadership to move from {pod_name} to {target}"
                    ));
                }
                Err(e) => return TaskResult::fail(format!("can't recreate {pod_name}: {e}")),
            }
        }

        info!(pod = %pod_name, reason = why, "deleting member pod for recreation");
        let namespace = ctx.group.namespace_or_default();
        if let Err(e) = self.shared.platform.delete_pod(&namespace, &pod_name).await {
            return TaskResult::fail(format!("can't delete pod {pod_name}: {e}"));
        }
        ctx.pod_mutated = true;
        self.shared.metrics.record_pod_action(&ctx.key(), "delete");
        self.shared
            .events
            .publish(
                &ctx.object_ref,
                EventType::Normal,
                reasons::POD_RECREATED,
                actions::DELETE_POD,
                Some(format!("deleted {pod_name}: {why}")),
            )
            .await;
        TaskResult::complete(format!("deleted {pod_name} for recreation"))
    }

    async fn sync(&self, ctx: &mut ReconcileContext, ordinal: i32) -> Option<TaskResult> {
        let Some(revision) = ctx.eligible_revision(ordinal) else {
            return Some(TaskResult::fail("revisions were not resolved before pods"));
        };
        let expected = match build_member_pod(
            &ctx.group,
            ordinal,
            &revision.template,
            &revision.config_hash,
            &revision.hash,
        ) {
            Ok(pod) => pod,
            Err(e) => {
                return Some(TaskResult::fail(format!(
                    "can't build pod for ordinal {ordinal}: {e}"
                )))
            }
        };

        let Some(observed) = ctx.pod(ordinal) else {
            return Some(self.create(ctx, ordinal, &expected).await);
        };
        if is_terminating(observed) {
            return Some(TaskResult::wait(format!(
                "waiting for {} to terminate",
                ctx.group.pod_name(ordinal)
            )));
        }
        if ctx.manual_override || ctx.pod_webhook || ctx.is_held(ordinal) {
            return None;
        }

        let comparison = compare_pods(&expected, observed);
        let config_changed = config_hash_label(&expected) != config_hash_label(observed);
        let recreate_on_config =
            ctx.group.spec.config_update_strategy == ConfigUpdateStrategy::RollingUpdate;

        match comparison {
            PodComparison::NoChange => None,
            PodComparison::NeedsRecreate => {
                Some(self.recreate(ctx, ordinal, "pod spec changed").await)
            }
            PodComparison::NeedsInPlaceUpdate if config_changed && recreate_on_config => {
                Some(self.recreate(ctx, ordinal, "configuration changed").await)
            }
            PodComparison::NeedsInPlaceUpdate => {
                let pod_name = ctx.group.pod_name(ordinal);
                match self.shared.platform.apply_pod(&expected).await {
                    Ok(_) => {
                        debug!(pod = %pod_name, "pod updated in place");
                        ctx.pod_mutated = true;
                        self.shared.metrics.record_pod_action(&ctx.key(), "update");
                        Some(TaskResult::complete(format!("updated {pod_name} in place")))
                    }
                    Err(e) if e.is_invalid() => Some(
                        self.recreate(ctx, ordinal, "in-place update rejected")
                            .await,
                    ),
                    Err(e) => Some(TaskResult::fail(format!("can't update pod {pod_name}: {e}"))),
                }
            }
        }
    }
}

#[async_trait]
impl Task<ReconcileContext> for Pods {
    fn name(&self) -> &str {
        "Pods"
    }

    async fn run(&self, ctx: &mut ReconcileContext) -> TaskResult {
        for ordinal in (0..ctx.replicas()).rev() {
            if let Some(result) = self.sync(ctx, ordinal).await {
                return result;
            }
        }
        TaskResult::complete("pods are synced")
    }
}
