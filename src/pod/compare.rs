//! Expected-versus-observed pod comparison

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

use crate::{LABEL_GROUP, LABEL_INSTANCE, LABEL_ORDINAL, LABEL_SPEC_HASH, LABEL_UPDATE_HASH};

/// What it takes to bring an observed pod to the expected manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodComparison {
    /// Observed pod already matches
    NoChange,
    /// Only mutable fields differ; patch the pod
    NeedsInPlaceUpdate,
    /// Immutable fields differ; the pod must be deleted and recreated
    NeedsRecreate,
}

fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

fn is_subset(
    expected: Option<&BTreeMap<String, String>>,
    observed: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let empty = BTreeMap::new();
    let observed = observed.unwrap_or(&empty);
    expected.iter().all(|(k, v)| observed.get(k) == Some(v))
}

/// Classify the difference between `expected` and `observed`
///
/// Pure: decided from object names, identity labels and the hash labels stamped
/// by [`super::build_member_pod`]. Labels and annotations added to the observed
/// pod by other actors are ignored; missing or changed expected ones are an
/// in-place update. A pod without our hash labels was not built by us and is
/// recreated.
pub fn compare_pods(expected: &Pod, observed: &Pod) -> PodComparison {
    if expected.metadata.name != observed.metadata.name
        || expected.metadata.namespace != observed.metadata.namespace
    {
        return PodComparison::NeedsRecreate;
    }

    for key in [LABEL_GROUP, LABEL_ORDINAL, LABEL_INSTANCE] {
        if label(expected, key) != label(observed, key) {
            return PodComparison::NeedsRecreate;
        }
    }

    match label(observed, LABEL_SPEC_HASH) {
        Some(hash) if Some(hash) == label(expected, LABEL_SPEC_HASH) => {}
        _ => return PodComparison::NeedsRecreate,
    }

    if label(expected, LABEL_UPDATE_HASH) != label(observed, LABEL_UPDATE_HASH)
        || !is_subset(
            expected.metadata.labels.as_ref(),
            observed.metadata.labels.as_ref(),
        )
        || !is_subset(
            expected.metadata.annotations.as_ref(),
            observed.metadata.annotations.as_ref(),
        )
    {
        return PodComparison::NeedsInPlaceUpdate;
    }

    PodComparison::NoChange
}

/// Returns true if the pod reports the `Ready` condition as `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Returns true if the pod is being deleted
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MemberGroup, MemberGroupSpec};
    use crate::pod::build_member_pod;
    use crate::LABEL_CONFIG_HASH;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use rstest::rstest;

    fn group() -> MemberGroup {
        let mut group = MemberGroup::new(
            "pd",
            MemberGroupSpec {
                replicas: 3,
                template: serde_json::from_value(serde_json::json!({
                    "image": "registry.local/member",
                    "version": "v8.1.0",
                    "labels": {"team": "storage"}
                }))
                .unwrap(),
                update_strategy: Default::default(),
                config_update_strategy: Default::default(),
                tls: None,
                cluster_domain: None,
                paused: false,
            },
        );
        group.metadata.namespace = Some("tidb".to_string());
        group
    }

    fn expected() -> Pod {
        let g = group();
        build_member_pod(&g, 0, &g.spec.template, "cfg-a", "rev-a").unwrap()
    }

    #[test]
    fn identical_manifests_need_nothing() {
        assert_eq!(compare_pods(&expected(), &expected()), PodComparison::NoChange);
    }

    #[test]
    fn foreign_labels_and_annotations_are_ignored() {
        let mut observed = expected();
        observed
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("injected".to_string(), "yes".to_string());
        observed.metadata.annotations =
            Some(BTreeMap::from([("kubectl".to_string(), "x".to_string())]));
        observed.status = Some(PodStatus::default());
        assert_eq!(compare_pods(&expected(), &observed), PodComparison::NoChange);
    }

    #[rstest]
    #[case::spec_hash(LABEL_SPEC_HASH, Some("other"), PodComparison::NeedsRecreate)]
    #[case::missing_spec_hash(LABEL_SPEC_HASH, None, PodComparison::NeedsRecreate)]
    #[case::ordinal(LABEL_ORDINAL, Some("7"), PodComparison::NeedsRecreate)]
    #[case::update_hash(LABEL_UPDATE_HASH, Some("other"), PodComparison::NeedsInPlaceUpdate)]
    #[case::config_hash(LABEL_CONFIG_HASH, Some("cfg-b"), PodComparison::NeedsInPlaceUpdate)]
    #[case::template_label("team", None, PodComparison::NeedsInPlaceUpdate)]
    fn observed_label_drift(
        #[case] key: &str,
        #[case] value: Option<&str>,
        #[case] want: PodComparison,
    ) {
        let mut observed = expected();
        let labels = observed.metadata.labels.get_or_insert_with(Default::default);
        match value {
            Some(v) => {
                labels.insert(key.to_string(), v.to_string());
            }
            None => {
                labels.remove(key);
            }
        }
        assert_eq!(compare_pods(&expected(), &observed), want);
    }

    #[test]
    fn renamed_pod_is_recreated() {
        let mut observed = expected();
        observed.metadata.namespace = Some("elsewhere".to_string());
        assert_eq!(
            compare_pods(&expected(), &observed),
            PodComparison::NeedsRecreate
        );
    }

    #[test]
    fn template_changes_classify_by_field() {
        let g = group();
        let observed = expected();

        let mut resized = g.spec.template.clone();
        resized.resources.memory = Some("8Gi".to_string());
        let want = build_member_pod(&g, 0, &resized, "cfg-a", "rev-b").unwrap();
        assert_eq!(compare_pods(&want, &observed), PodComparison::NeedsInPlaceUpdate);

        let mut moved = g.spec.template.clone();
        moved.peer_port = 2390;
        let want = build_member_pod(&g, 0, &moved, "cfg-a", "rev-b").unwrap();
        assert_eq!(compare_pods(&want, &observed), PodComparison::NeedsRecreate);
    }

    #[test]
    fn readiness_reads_the_ready_condition() {
        let mut pod = expected();
        assert!(!is_pod_ready(&pod));
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_pod_ready(&pod));
    }
}
