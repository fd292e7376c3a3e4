//! Per-ordinal ConfigMaps and PersistentVolumeClaims

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controller::context::ReconcileContext;
use crate::controller::Context;
use crate::pod::{build_member_config_map, build_member_pvcs};
use crate::task::{Task, TaskResult};

/// Applies the configuration and storage every member pod mounts
///
/// Each ordinal gets the ConfigMap of the revision it is eligible for, so a
/// member below the partition keeps reading its current configuration while
/// the roll is in flight. A held member whose pod runs some other revision,
/// left behind by a superseded roll, keeps the ConfigMap it has. Claims are only ever created; storage is never
/// resized or removed here.
pub struct MemberResources {
    shared: Arc<Context>,
}

impl MemberResources {
    /// Create the task
    pub fn new(shared: Arc<Context>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Task<ReconcileContext> for MemberResources {
    fn name(&self) -> &str {
        "MemberResources"
    }

    async fn run(&self, ctx: &mut ReconcileContext) -> TaskResult {
        for ordinal in 0..ctx.replicas() {
            let Some(revision) = ctx.eligible_revision(ordinal) else {
                return TaskResult::fail("revisions were not resolved before member resources");
            };

            if ctx.is_held(ordinal) && ctx.pod_revision(ordinal) != Some(revision.hash.as_str()) {
                debug!(ordinal, "member held below the partition, config left as is");
            } else {
                let config_map = build_member_config_map(
                    &ctx.group,
                    ordinal,
                    &revision.template,
                    &revision.config_hash,
                );
                if let Err(e) = self.shared.platform.apply_config_map(&config_map).await {
                    return TaskResult::fail(format!(
                        "can't apply config for {}: {e}",
                        ctx.group.pod_name(ordinal)
                    ));
                }
            }

            for pvc in build_member_pvcs(&ctx.group, ordinal, &revision.template) {
                if let Err(e) = self.shared.platform.ensure_pvc(&pvc).await {
                    return TaskResult::fail(format!(
                        "can't create claim {}: {e}",
                        pvc.metadata.name.as_deref().unwrap_or_default()
                    ));
                }
            }
            debug!(ordinal, revision = %revision.hash, "member resources applied");
        }

        TaskResult::complete("member resources are synced")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::context::Revision;
    use crate::controller::tests::{observed_pod, sample_group, test_context};
    use crate::controller::MockPlatformClient;
    use crate::crd::VolumeSpec;
    use crate::member::MockMemberControl;
    use crate::pod::CONFIG_FILE_NAME;
    use crate::task::TaskKind;
    use crate::{Error, LABEL_REVISION};
    use std::sync::Mutex;

    fn ctx_for(replicas: i32, volumes: bool) -> ReconcileContext {
        let mut group = sample_group(replicas);
        if volumes {
            group.spec.template.volumes = vec![VolumeSpec {
                name: "data".to_string(),
                path: "/var/lib/member".to_string(),
                storage: "10Gi".to_string(),
                storage_class_name: None,
            }];
        }
        let mut ctx =
            ReconcileContext::new(Arc::new(group), Arc::new(MockMemberControl::new()), false);
        let mut current = ctx.group.spec.template.clone();
        current.config = "mode = \"old\"\n".to_string();
        let mut update = ctx.group.spec.template.clone();
        update.config = "mode = \"new\"\n".to_string();
        ctx.current = Some(Revision {
            template: current,
            hash: "rev-1".to_string(),
            config_hash: "cfg-1".to_string(),
        });
        ctx.update = Some(Revision {
            template: update,
            hash: "rev-2".to_string(),
            config_hash: "cfg-2".to_string(),
        });
        ctx
    }

    #[tokio::test]
    async fn config_follows_the_partition() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let seen = applied.clone();
        let mut platform = MockPlatformClient::new();
        platform.expect_apply_config_map().returning(move |cm| {
            let name = cm.metadata.name.clone().unwrap_or_default();
            let data = cm.data.as_ref().unwrap()[CONFIG_FILE_NAME].clone();
            seen.lock().unwrap().push((name, data));
            Ok(())
        });
        platform.expect_ensure_pvc().never();

        let mut ctx = ctx_for(3, false);
        ctx.partition = 2;
        let result = MemberResources::new(Arc::new(test_context(platform)))
            .run(&mut ctx)
            .await;

        assert!(result.is_complete());
        let applied = applied.lock().unwrap();
        assert_eq!(applied.len(), 3);
        assert!(applied[0].1.contains("old"));
        assert!(applied[1].1.contains("old"));
        assert!(applied[2].1.contains("new"));
    }

    #[tokio::test]
    async fn member_left_on_a_superseded_revision_keeps_its_config() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let seen = applied.clone();
        let mut platform = MockPlatformClient::new();
        platform.expect_apply_config_map().returning(move |cm| {
            seen.lock()
                .unwrap()
                .push(cm.metadata.name.clone().unwrap_or_default());
            Ok(())
        });

        let mut ctx = ctx_for(3, false);
        ctx.partition = 2;
        for (ordinal, revision) in [(0, "rev-1"), (1, "rev-0")] {
            let mut pod = observed_pod(&ctx.group, ordinal, true);
            pod.metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(LABEL_REVISION.to_string(), revision.to_string());
            ctx.pods.insert(ordinal, pod);
        }

        let result = MemberResources::new(Arc::new(test_context(platform)))
            .run(&mut ctx)
            .await;

        assert!(result.is_complete());
        assert_eq!(*applied.lock().unwrap(), vec!["pd-0", "pd-2"]);
    }

    #[tokio::test]
    async fn claims_are_ensured_per_ordinal() {
        let mut platform = MockPlatformClient::new();
        platform.expect_apply_config_map().returning(|_| Ok(()));
        platform
            .expect_ensure_pvc()
            .times(2)
            .returning(|_| Ok(()));

        let mut ctx = ctx_for(2, true);
        let result = MemberResources::new(Arc::new(test_context(platform)))
            .run(&mut ctx)
            .await;
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn apply_failure_fails_the_pass() {
        let mut platform = MockPlatformClient::new();
        platform
            .expect_apply_config_map()
            .times(1)
            .returning(|_| Err(Error::validation("quota exceeded")));

        let mut ctx = ctx_for(3, false);
        let result = MemberResources::new(Arc::new(test_context(platform)))
            .run(&mut ctx)
            .await;
        assert_eq!(result.kind(), TaskKind::Fail);
        assert!(result.reason().contains("pd-0"));
    }
}
