//! Partition-stepping rolling upgrade

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crate::controller::context::ReconcileContext;
use crate::controller::leader::transfer_leader_away;
use crate::controller::Context;
use crate::events::{actions, reasons};
use crate::task::{Task, TaskResult};
use crate::Error;

/// Moves the partition boundary down by at most one ordinal per pass
///
/// Ordinals are visited from the highest down. Ordinals already on the update
/// revision and healthy are skipped; the first one that is not is opened for
/// update, after leadership has been moved off it. Once every ordinal down to
/// the partition floor matches, the update revision becomes current.
pub struct RollingUpgrade {
    shared: Arc<Context>,
}

impl RollingUpgrade {
    /// Create the task
    pub fn new(shared: Arc<Context>) -> Self {
        Self { shared }
    }

    async fn event(&self, ctx: &ReconcileContext, reason: &str, note: String) {
        self.shared
            .events
            .publish(
                &ctx.object_ref,
                EventType::Normal,
                reason,
                actions::UPGRADE,
                Some(note),
            )
            .await;
    }
}

#[async_trait]
impl Task<ReconcileContext> for RollingUpgrade {
    fn name(&self) -> &str {
        "RollingUpgrade"
    }

    async fn run(&self, ctx: &mut ReconcileContext) -> TaskResult {
        let (Some(current), Some(update)) = (ctx.current.clone(), ctx.update.clone()) else {
            return TaskResult::fail("revisions were not resolved before the rolling upgrade");
        };

        if update.hash == current.hash {
            return TaskResult::complete("no roll in progress");
        }

        if ctx.scaling {
            debug!("replica count changing, roll frozen");
            return TaskResult::complete("roll frozen while the group scales");
        }

        if ctx.roll_started {
            self.event(
                ctx,
                reasons::ROLL_STARTED,
                format!("rolling from {} to {}", current.hash, update.hash),
            )
            .await;
        }

        if ctx.group.spec.update_strategy.is_manual_override() {
            if !ctx.manual_override {
                ctx.manual_override = true;
                self.event(
                    ctx,
                    reasons::MANUAL_OVERRIDE,
                    "update strategy hands pod replacement to the user".to_string(),
                )
                .await;
            }
            return TaskResult::complete("update strategy manually overridden");
        }

        let Some(snapshot) = ctx.snapshot.clone() else {
            return TaskResult::wait(format!(
                "member health unavailable: {}",
                ctx.snapshot_error.as_deref().unwrap_or("no snapshot")
            ));
        };

        let floor = ctx.group.partition_floor();
        for ordinal in (floor..ctx.replicas()).rev() {
            if ctx.pod_revision(ordinal) == Some(update.hash.as_str()) && ctx.is_healthy(ordinal) {
                continue;
            }

            if ctx.pod_webhook {
                ctx.partition = ctx.partition.min(ordinal);
                return TaskResult::complete(format!(
                    "partition at {}, pod mutation left to the webhook",
                    ctx.partition
                ));
            }

            if ctx.is_leader(ordinal) {
                return match transfer_leader_away(ctx, &self.shared, &snapshot, ordinal).await {
                    Ok(target) => TaskResult::retry(format!(
                        "leadership moving from {} to {target} before upgrade",
                        ctx.group.pod_name(ordinal)
                    )),
                    Err(e @ Error::NoHealthyTransferee { .. }) => TaskResult::fail(e.to_string()),
                    Err(e) => TaskResult::fail(format!("leader transfer failed: {e}")),
                };
            }

            if ordinal < ctx.partition {
                info!(ordinal, "opening ordinal for update");
            }
            ctx.partition = ctx.partition.min(ordinal);
            return TaskResult::complete(format!(
                "upgrading {}, partition at {}",
                ctx.group.pod_name(ordinal),
                ctx.partition
            ));
        }

        ctx.partition = floor;
        if floor > 0 {
            return TaskResult::complete(format!("roll held at partition {floor}"));
        }

        info!(revision = %update.hash, "roll complete");
        ctx.current = Some(update.clone());
        self.event(
            ctx,
            reasons::ROLL_COMPLETE,
            format!("every member runs revision {}", update.hash),
        )
        .await;
        TaskResult::complete(format!("roll to {} complete", update.hash))
    }
}
