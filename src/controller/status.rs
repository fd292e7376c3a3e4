//! Status written back after every pass

use std::collections::BTreeSet;

use tracing::debug;

use super::context::ReconcileContext;
use super::Context;
use crate::crd::{Condition, ConditionStatus, GroupPhase, MemberGroup, MemberGroupStatus, MemberStatus};
use crate::pod::is_pod_ready;
use crate::task::{TaskKind, TaskResult};
use crate::Error;

/// Condition reporting the outcome of the last pass
pub const CONDITION_SYNCED: &str = "Synced";

/// Condition reporting that every member is ready on the current revision
pub const CONDITION_READY: &str = "Ready";

/// Compute the status for the end of a pass that returned `result`
///
/// Starts from the status read at the beginning of the pass. Membership is
/// refreshed only when a health snapshot was obtained; otherwise the last
/// observed leader and members are kept.
pub fn build_status(ctx: &ReconcileContext, result: &TaskResult) -> MemberGroupStatus {
    let mut status = ctx.status.clone();
    let replicas = ctx.replicas();
    let update_hash = ctx.update.as_ref().map(|r| r.hash.as_str());

    status.replicas = ctx.pods.len() as i32;
    status.ready_replicas = ctx.pods.values().filter(|p| is_pod_ready(p)).count() as i32;
    status.updated_replicas = ctx
        .pods
        .keys()
        .filter(|&&o| update_hash.is_some() && ctx.pod_revision(o) == update_hash)
        .count() as i32;

    if let Some(current) = &ctx.current {
        status.current_revision = Some(current.hash.clone());
        status.current_template = Some(current.template.clone());
    }
    if let Some(update) = &ctx.update {
        status.update_revision = Some(update.hash.clone());
        status.update_template = Some(update.template.clone());
    }
    status.partition = Some(ctx.partition);

    if let Some(snapshot) = &ctx.snapshot {
        status.leader = snapshot.leader.clone();
        let ordinals: BTreeSet<i32> = (0..replicas).chain(ctx.pods.keys().copied()).collect();
        status.members = ordinals
            .into_iter()
            .map(|ordinal| {
                let known = ctx.member(ordinal);
                MemberStatus {
                    name: known
                        .map(|m| m.name.clone())
                        .unwrap_or_else(|| ctx.group.member_name(ordinal)),
                    ordinal,
                    health: known.is_some_and(|m| m.health),
                    is_leader: ctx.is_leader(ordinal),
                    revision: ctx.pod_revision(ordinal).map(str::to_string),
                }
            })
            .collect();
    }

    let settled = (0..replicas).all(|o| ctx.pods.contains_key(&o))
        && ctx.pods.range(replicas..).next().is_none();
    if settled {
        status.settled_replicas = Some(replicas);
    }

    let rolling = match (&ctx.current, &ctx.update) {
        (Some(current), Some(update)) => current.hash != update.hash,
        _ => false,
    };
    status.phase = if result.kind() == TaskKind::Fail {
        GroupPhase::Failed
    } else if ctx.scaling {
        GroupPhase::Scaling
    } else if rolling {
        GroupPhase::Upgrading
    } else {
        GroupPhase::Normal
    };

    let synced = if result.is_complete() {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    status.set_condition(Condition::new(
        CONDITION_SYNCED,
        synced,
        result.kind().to_string(),
        result.reason(),
    ));

    let ready = status.phase == GroupPhase::Normal
        && settled
        && status.ready_replicas == replicas
        && status.updated_replicas == replicas;
    status.set_condition(if ready {
        Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "AllMembersReady",
            format!("{replicas} of {replicas} members ready"),
        )
    } else {
        Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "MembersNotReady",
            format!("{} of {replicas} members ready", status.ready_replicas),
        )
    });

    status.message = Some(result.reason().to_string());
    status.observed_generation = ctx.group.metadata.generation;
    status
}

/// Status for a group whose spec was rejected before the pipeline ran
pub fn failed_status(group: &MemberGroup, reason: &str) -> MemberGroupStatus {
    let mut status = group.status.clone().unwrap_or_default();
    status.phase = GroupPhase::Failed;
    status.set_condition(Condition::new(
        CONDITION_SYNCED,
        ConditionStatus::False,
        "ValidationFailed",
        reason,
    ));
    status.message = Some(reason.to_string());
    status.observed_generation = group.metadata.generation;
    status
}

/// Patch `status` onto `group` unless nothing changed
///
/// The write is guarded by the resource version the pass started from, so a
/// pass that raced another writer fails with [`Error::Conflict`] instead of
/// overwriting newer state.
pub async fn write_status(
    shared: &Context,
    group: &MemberGroup,
    status: &MemberGroupStatus,
) -> Result<(), Error> {
    if group.status.as_ref() == Some(status) {
        debug!("status unchanged, skipping write");
        return Ok(());
    }
    shared
        .platform
        .patch_status(
            &group.namespace_or_default(),
            &group.group_name(),
            group.metadata.resource_version.clone(),
            status,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::context::Revision;
    use crate::controller::tests::{member, observed_pod, sample_group, snapshot_of, test_context};
    use crate::controller::MockPlatformClient;
    use crate::member::MockMemberControl;
    use crate::LABEL_REVISION;
    use std::sync::Arc;

    fn converged(replicas: i32) -> ReconcileContext {
        let group = Arc::new(sample_group(replicas));
        let mut ctx = ReconcileContext::new(group.clone(), Arc::new(MockMemberControl::new()), false);
        let revision = Revision {
            template: group.spec.template.clone(),
            hash: "rev-1".to_string(),
            config_hash: "cfg".to_string(),
        };
        for o in 0..replicas {
            let mut pod = observed_pod(&group, o, true);
            pod.metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(LABEL_REVISION.to_string(), "rev-1".to_string());
            ctx.pods.insert(o, pod);
        }
        ctx.current = Some(revision.clone());
        ctx.update = Some(revision);
        ctx.snapshot = Some(snapshot_of(vec![
            member("pd-0", true, false),
            member("pd-1", true, true),
            member("pd-2", true, false),
        ]));
        ctx
    }

    fn condition<'a>(status: &'a MemberGroupStatus, type_: &str) -> &'a Condition {
        status.conditions.iter().find(|c| c.type_ == type_).unwrap()
    }

    #[test]
    fn converged_group_is_normal_and_ready() {
        let ctx = converged(3);
        let status = build_status(&ctx, &TaskResult::complete("pods are synced"));

        assert_eq!(status.phase, GroupPhase::Normal);
        assert_eq!(status.replicas, 3);
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.updated_replicas, 3);
        assert_eq!(status.settled_replicas, Some(3));
        assert_eq!(status.leader.as_deref(), Some("pd-1"));
        assert_eq!(status.members.len(), 3);
        assert!(status.members[1].is_leader);
        assert_eq!(condition(&status, CONDITION_READY).status, ConditionStatus::True);
        assert_eq!(condition(&status, CONDITION_SYNCED).status, ConditionStatus::True);
    }

    #[test]
    fn phase_reflects_roll_scale_and_failure() {
        let mut ctx = converged(3);
        ctx.update.as_mut().unwrap().hash = "rev-2".to_string();
        let status = build_status(&ctx, &TaskResult::complete("upgrading"));
        assert_eq!(status.phase, GroupPhase::Upgrading);
        assert_eq!(status.updated_replicas, 0);
        assert_eq!(status.update_revision.as_deref(), Some("rev-2"));

        ctx.scaling = true;
        assert_eq!(
            build_status(&ctx, &TaskResult::wait("x")).phase,
            GroupPhase::Scaling
        );

        let status = build_status(&ctx, &TaskResult::fail("no healthy transferee"));
        assert_eq!(status.phase, GroupPhase::Failed);
        assert_eq!(status.message.as_deref(), Some("no healthy transferee"));
        assert_eq!(condition(&status, CONDITION_SYNCED).reason, "Fail");
    }

    #[test]
    fn missing_pods_do_not_settle_replicas() {
        let mut ctx = converged(3);
        ctx.pods.remove(&1);
        ctx.status.settled_replicas = Some(2);
        let status = build_status(&ctx, &TaskResult::complete("created pd-1"));
        assert_eq!(status.settled_replicas, Some(2));
        assert_eq!(condition(&status, CONDITION_READY).status, ConditionStatus::False);
    }

    #[test]
    fn membership_survives_a_missing_snapshot() {
        let mut ctx = converged(3);
        ctx.status.leader = Some("pd-2".to_string());
        ctx.snapshot = None;
        let status = build_status(&ctx, &TaskResult::complete("ok"));
        assert_eq!(status.leader.as_deref(), Some("pd-2"));
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let mut platform = MockPlatformClient::new();
        platform.expect_patch_status().never();
        let shared = test_context(platform);

        let ctx = converged(3);
        let status = build_status(&ctx, &TaskResult::complete("pods are synced"));
        let mut group = sample_group(3);
        group.status = Some(status.clone());
        write_status(&shared, &group, &status).await.unwrap();
    }

    #[tokio::test]
    async fn changed_status_is_written_with_resource_version() {
        let mut platform = MockPlatformClient::new();
        platform
            .expect_patch_status()
            .withf(|ns, name, rv, _| ns == "tidb" && name == "pd" && rv.as_deref() == Some("42"))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let shared = test_context(platform);

        let mut group = sample_group(3);
        group.metadata.resource_version = Some("42".to_string());
        let status = failed_status(&group, "replicas must be non-negative");
        write_status(&shared, &group, &status).await.unwrap();
    }
}
