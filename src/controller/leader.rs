//! Leader safety: transfer-target selection and the pre-delete check

use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use super::context::ReconcileContext;
use super::Context;
use crate::crd::MemberGroup;
use crate::events::{actions, reasons};
use crate::member::HealthSnapshot;
use crate::Error;

/// Pick the member that should take over leadership from `vacated`
///
/// With more than one replica the target alternates between the extremes: the
/// highest ordinal, or the lowest when `vacated` is the highest. The member
/// name is used if the snapshot knows it, the pod name otherwise. With a single
/// replica the first healthy peer other than `vacated` is used. `None` means
/// nobody can take over.
pub fn select_transfer_target(
    group: &MemberGroup,
    snapshot: &HealthSnapshot,
    vacated: i32,
) -> Option<String> {
    let replicas = group.spec.replicas;
    if replicas > 1 {
        let max = replicas - 1;
        let target = if vacated == max { 0 } else { max };
        let name = group.member_name(target);
        if snapshot.get(&name).is_some() {
            return Some(name);
        }
        return Some(group.pod_name(target));
    }

    let vacated_member = group.member_name(vacated);
    let vacated_pod = group.pod_name(vacated);
    snapshot
        .members
        .values()
        .find(|m| m.health && m.name != vacated_member && m.name != vacated_pod)
        .map(|m| m.name.clone())
}

/// Pick a transfer target that is known to be healthy
///
/// Starts from [`select_transfer_target`]. A candidate the snapshot does not
/// report healthy is passed over for the first healthy member at an ordinal
/// below `replicas`, then for any other healthy peer. `vacated` itself is never
/// chosen.
pub fn select_healthy_transferee(
    group: &MemberGroup,
    snapshot: &HealthSnapshot,
    vacated: i32,
) -> Option<String> {
    let (vacated_member, vacated_pod) = (group.member_name(vacated), group.pod_name(vacated));
    let healthy = |name: &str| {
        name != vacated_member && name != vacated_pod && snapshot.get(name).is_some_and(|m| m.health)
    };

    if let Some(candidate) = select_transfer_target(group, snapshot, vacated) {
        if healthy(&candidate) {
            return Some(candidate);
        }
        debug!(candidate = %candidate, "transfer candidate is not healthy, looking for another");
    }

    (0..group.spec.replicas.max(0))
        .filter(|&o| o != vacated)
        .flat_map(|o| [group.member_name(o), group.pod_name(o)])
        .find(|name| healthy(name))
        .or_else(|| {
            snapshot
                .members
                .values()
                .find(|m| healthy(&m.name))
                .map(|m| m.name.clone())
        })
}

/// Outcome of a successful pre-delete check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreDelete {
    /// The member is not the leader; the destructive action may go ahead
    Proceed,
    /// Leadership is moving to the named member; re-check on a later pass
    TransferIssued(String),
}

/// Move leadership off `ordinal` if it holds it
///
/// Errors with [`Error::NoHealthyTransferee`] when no member can take over and
/// with [`Error::ControlPlane`] when the transfer request fails. Without a
/// health snapshot leadership cannot be ruled out, so the member is reported
/// as unsafe to disrupt.
pub async fn pre_delete_check(
    rtx: &ReconcileContext,
    shared: &Context,
    ordinal: i32,
) -> Result<PreDelete, Error> {
    // TODO: check that quorum survives losing this member as well.
    let Some(snapshot) = rtx.snapshot.as_ref() else {
        return Err(Error::control_plane(format!(
            "member health unavailable: {}",
            rtx.snapshot_error.as_deref().unwrap_or("no snapshot")
        )));
    };
    if !rtx.is_leader(ordinal) {
        return Ok(PreDelete::Proceed);
    }
    let target = transfer_leader_away(rtx, shared, snapshot, ordinal).await?;
    Ok(PreDelete::TransferIssued(target))
}

/// Select a healthy target and ask the control plane to move leadership there
pub async fn transfer_leader_away(
    rtx: &ReconcileContext,
    shared: &Context,
    snapshot: &HealthSnapshot,
    ordinal: i32,
) -> Result<String, Error> {
    let group_key = rtx.key();
    let leader = rtx.group.member_name(ordinal);

    let Some(target) = select_healthy_transferee(&rtx.group, snapshot, ordinal) else {
        warn!(leader = %leader, "no healthy member can take over leadership");
        shared
            .events
            .publish(
                &rtx.object_ref,
                EventType::Warning,
                reasons::NO_HEALTHY_TRANSFEREE,
                actions::TRANSFER_LEADER,
                Some(format!("{leader} holds leadership and no healthy member can take over")),
            )
            .await;
        return Err(Error::NoHealthyTransferee { leader });
    };

    info!(from = %leader, to = %target, "transferring leadership");
    let result = rtx.members.transfer_leadership(&target).await;
    shared.metrics.record_transfer(&group_key, result.is_ok());
    result?;

    shared
        .events
        .publish(
            &rtx.object_ref,
            EventType::Normal,
            reasons::LEADER_TRANSFERRED,
            actions::TRANSFER_LEADER,
            Some(format!("leadership moving from {leader} to {target}")),
        )
        .await;
    Ok(target)
}
