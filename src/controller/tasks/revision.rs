//! Resolve current and update revisions

use async_trait::async_trait;
use tracing::info;

use crate::controller::context::{ReconcileContext, Revision};
use crate::crd::MemberTemplate;
use crate::hash::{config_hash, revision_hash};
use crate::task::{Task, TaskResult};
use crate::Error;

fn revision_of(template: &MemberTemplate) -> Result<Revision, Error> {
    Ok(Revision {
        hash: revision_hash(template)?,
        config_hash: config_hash(&template.config),
        template: template.clone(),
    })
}

/// Computes the current and update revisions and the partition to start from
///
/// - A group seen for the first time adopts its template as current.
/// - While the replica count is changing the in-flight update (or the current
///   revision) is kept, so a template edit never starts rolling mid-scale.
/// - A template revision not seen before starts a new roll: the partition is
///   reset to `replicas`, closing every ordinal.
pub struct ResolveRevisions;

#[async_trait]
impl Task<ReconcileContext> for ResolveRevisions {
    fn name(&self) -> &str {
        "Revision"
    }

    async fn run(&self, ctx: &mut ReconcileContext) -> TaskResult {
        match resolve(ctx) {
            Ok(reason) => TaskResult::complete(reason),
            Err(e) => TaskResult::fail(format!("can't compute revisions: {e}")),
        }
    }
}

fn resolve(ctx: &mut ReconcileContext) -> Result<String, Error> {
    let replicas = ctx.replicas();
    let desired = revision_of(&ctx.group.spec.template)?;

    let current = match (
        ctx.status.current_template.as_ref(),
        ctx.status.current_revision.as_ref(),
    ) {
        (Some(template), Some(_)) => revision_of(template)?,
        _ => {
            info!(revision = %desired.hash, "adopting template as current revision");
            ctx.partition = 0;
            desired.clone()
        }
    };

    ctx.scaling = ctx
        .status
        .settled_replicas
        .is_some_and(|settled| settled != replicas);

    let in_flight = match (
        ctx.status.update_template.as_ref(),
        ctx.status.update_revision.as_ref(),
    ) {
        (Some(template), Some(hash)) if *hash != current.hash => Some(revision_of(template)?),
        _ => None,
    };

    let update = if ctx.scaling {
        in_flight.unwrap_or_else(|| current.clone())
    } else {
        if desired.hash == current.hash {
            ctx.partition = 0;
        } else if in_flight.as_ref().map(|r| &r.hash) != Some(&desired.hash) {
            info!(
                from = %current.hash,
                to = %desired.hash,
                "new template revision, starting roll"
            );
            ctx.partition = replicas;
            ctx.roll_started = true;
        }
        desired
    };

    ctx.partition = ctx.partition.clamp(0, replicas);
    let reason = format!(
        "current revision {}, update revision {}, partition {}",
        current.hash, update.hash, ctx.partition
    );
    ctx.current = Some(current);
    ctx.update = Some(update);
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::sample_group;
    use crate::crd::{MemberGroup, MemberGroupStatus};
    use crate::member::MockMemberControl;
    use std::sync::Arc;

    fn ctx(group: MemberGroup) -> ReconcileContext {
        ReconcileContext::new(Arc::new(group), Arc::new(MockMemberControl::new()), false)
    }

    fn settled(group: &MemberGroup, partition: i32) -> MemberGroupStatus {
        MemberGroupStatus {
            current_revision: Some(revision_hash(&group.spec.template).unwrap()),
            current_template: Some(group.spec.template.clone()),
            update_revision: Some(revision_hash(&group.spec.template).unwrap()),
            update_template: Some(group.spec.template.clone()),
            partition: Some(partition),
            settled_replicas: Some(group.spec.replicas),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_pass_adopts_the_template() {
        let mut ctx = ctx(sample_group(3));
        assert!(ResolveRevisions.run(&mut ctx).await.is_complete());

        let (current, update) = (ctx.current.unwrap(), ctx.update.unwrap());
        assert_eq!(current.hash, update.hash);
        assert_eq!(ctx.partition, 0);
        assert!(!ctx.roll_started);
        assert!(!ctx.scaling);
    }

    #[tokio::test]
    async fn template_change_starts_a_roll_with_partition_closed() {
        let mut group = sample_group(3);
        group.status = Some(settled(&group, 0));
        group.spec.template.version = "v8.2.0".to_string();

        let mut ctx = ctx(group);
        ResolveRevisions.run(&mut ctx).await;

        assert!(ctx.roll_started);
        assert_eq!(ctx.partition, 3);
        assert_ne!(ctx.current.unwrap().hash, ctx.update.unwrap().hash);
    }

    #[tokio::test]
    async fn in_flight_roll_keeps_its_partition() {
        let mut group = sample_group(3);
        let mut status = settled(&group, 1);
        group.spec.template.version = "v8.2.0".to_string();
        status.update_revision = Some(revision_hash(&group.spec.template).unwrap());
        status.update_template = Some(group.spec.template.clone());
        group.status = Some(status);

        let mut ctx = ctx(group);
        ResolveRevisions.run(&mut ctx).await;

        assert!(!ctx.roll_started);
        assert_eq!(ctx.partition, 1);
    }

    #[tokio::test]
    async fn cosmetic_config_edit_is_not_a_new_revision() {
        let mut group = sample_group(3);
        group.spec.template.config = "a = 1\n".to_string();
        group.status = Some(settled(&group, 0));
        group.spec.template.config = "a = 1   \n\n".to_string();

        let mut ctx = ctx(group);
        ResolveRevisions.run(&mut ctx).await;
        assert!(!ctx.roll_started);
        assert_eq!(ctx.current.unwrap().hash, ctx.update.unwrap().hash);
    }

    #[tokio::test]
    async fn scaling_freezes_the_template() {
        let mut group = sample_group(3);
        group.status = Some(settled(&group, 0));
        let old = group.spec.template.clone();
        group.spec.replicas = 5;
        group.spec.template.version = "v8.2.0".to_string();

        let mut ctx = ctx(group);
        ResolveRevisions.run(&mut ctx).await;

        assert!(ctx.scaling);
        assert!(!ctx.roll_started);
        assert_eq!(ctx.update.unwrap().template, old);
    }
}
