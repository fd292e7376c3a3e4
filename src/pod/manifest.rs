//! Expected-state builders for member pods and their per-ordinal dependents
//!
//! Everything here is a pure function of the group, the ordinal and the
//! template that ordinal is eligible for, so repeated passes build
//! byte-identical objects.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe,
    ResourceRequirements, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;

use crate::crd::{MemberGroup, MemberTemplate};
use crate::hash::deterministic_hash;
use crate::{
    Error, LABEL_CONFIG_HASH, LABEL_GROUP, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_ORDINAL,
    LABEL_REVISION, LABEL_SPEC_HASH, LABEL_UPDATE_HASH, MANAGED_BY,
};

/// Directory the member configuration is mounted at
pub const CONFIG_MOUNT_PATH: &str = "/etc/member";

/// Key of the configuration file inside the per-ordinal ConfigMap
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Mount path of the cluster TLS secret
pub const TLS_MOUNT_PATH: &str = "/var/lib/regent-tls";

/// Mount path of the cluster client TLS secret
pub const CLIENT_TLS_MOUNT_PATH: &str = "/var/lib/regent-client-tls";

const MEMBER_CONTAINER: &str = "member";
const MEMBER_BINARY: &str = "/member-server";
const CONFIG_VOLUME: &str = "config";
const TLS_VOLUME: &str = "cluster-tls";
const CLIENT_TLS_VOLUME: &str = "cluster-client-tls";
const READINESS_INITIAL_DELAY_SECONDS: i32 = 5;

/// Labels that identify a member; a pod whose identity labels change is a different member
pub fn identity_labels(group: &MemberGroup, ordinal: i32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_GROUP.to_string(), group.group_name()),
        (LABEL_ORDINAL.to_string(), ordinal.to_string()),
        (LABEL_INSTANCE.to_string(), group.pod_name(ordinal)),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Label selector matching every pod of a group
pub fn group_selector(group: &MemberGroup) -> String {
    format!(
        "{}={},{}={}",
        LABEL_GROUP,
        group.group_name(),
        LABEL_MANAGED_BY,
        MANAGED_BY
    )
}

/// Name of the ConfigMap holding the configuration for `ordinal`
pub fn config_map_name(group: &MemberGroup, ordinal: i32) -> String {
    group.pod_name(ordinal)
}

/// Name of the claim backing `volume` for `ordinal`
pub fn pvc_name(group: &MemberGroup, ordinal: i32, volume: &str) -> String {
    format!("{}-{}", group.pod_name(ordinal), volume)
}

fn owner_reference(group: &MemberGroup) -> OwnerReference {
    OwnerReference {
        api_version: MemberGroup::api_version(&()).to_string(),
        kind: MemberGroup::kind(&()).to_string(),
        name: group.group_name(),
        uid: group.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn dependent_meta(
    group: &MemberGroup,
    name: String,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(group.namespace_or_default()),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(group)]),
        ..Default::default()
    }
}

fn resource_requirements(template: &MemberTemplate) -> Option<ResourceRequirements> {
    if template.resources.is_empty() {
        return None;
    }
    let mut quantities = BTreeMap::new();
    if let Some(cpu) = &template.resources.cpu {
        quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &template.resources.memory {
        quantities.insert("memory".to_string(), Quantity(memory.clone()));
    }
    Some(ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    })
}

fn secret_volume(name: &str, secret_name: String) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Build the expected pod for `ordinal`
///
/// `template` is the template the ordinal is eligible for (update template at or
/// above the partition, current template below it). The pod carries two hash
/// labels used by [`super::compare_pods`]: one over the fields that need a
/// restart to change and one over the fields that can be patched in place.
pub fn build_member_pod(
    group: &MemberGroup,
    ordinal: i32,
    template: &MemberTemplate,
    config_hash: &str,
    revision: &str,
) -> Result<Pod, Error> {
    let pod_name = group.pod_name(ordinal);
    let group_name = group.group_name();

    let mut volumes = vec![Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name(group, ordinal),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![read_only_mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH)];

    for vol in &template.volumes {
        volumes.push(Volume {
            name: vol.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(group, ordinal, &vol.name),
                read_only: Some(false),
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: vol.name.clone(),
            mount_path: vol.path.clone(),
            ..Default::default()
        });
    }

    if let Some(tls) = group.spec.tls.as_ref().filter(|t| t.enabled) {
        let secret = tls
            .secret_name
            .clone()
            .unwrap_or_else(|| format!("{group_name}-cluster-secret"));
        volumes.push(secret_volume(TLS_VOLUME, secret));
        mounts.push(read_only_mount(TLS_VOLUME, TLS_MOUNT_PATH));

        if tls.mount_client_secret {
            let client_secret = tls
                .client_secret_name
                .clone()
                .unwrap_or_else(|| format!("{group_name}-cluster-client-secret"));
            volumes.push(secret_volume(CLIENT_TLS_VOLUME, client_secret));
            mounts.push(read_only_mount(CLIENT_TLS_VOLUME, CLIENT_TLS_MOUNT_PATH));
        }
    }

    let container = Container {
        name: MEMBER_CONTAINER.to_string(),
        image: Some(template.image_ref()),
        command: Some(vec![
            MEMBER_BINARY.to_string(),
            "--config".to_string(),
            format!("{CONFIG_MOUNT_PATH}/{CONFIG_FILE_NAME}"),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: template.client_port,
                ..Default::default()
            },
            ContainerPort {
                name: Some("peer".to_string()),
                container_port: template.peer_port,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(mounts),
        resources: resource_requirements(template),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(template.client_port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(READINESS_INITIAL_DELAY_SECONDS),
            ..Default::default()
        }),
        ..Default::default()
    };

    let spec = PodSpec {
        hostname: Some(pod_name.clone()),
        subdomain: Some(group.peer_service_name()),
        containers: vec![container],
        volumes: Some(volumes),
        node_selector: (!template.node_selector.is_empty())
            .then(|| template.node_selector.clone()),
        ..Default::default()
    };

    let (spec_hash, update_hash) = pod_hashes(&spec)?;

    let mut labels = template.labels.clone();
    labels.extend(identity_labels(group, ordinal));
    labels.insert(LABEL_CONFIG_HASH.to_string(), config_hash.to_string());
    labels.insert(LABEL_REVISION.to_string(), revision.to_string());
    labels.insert(LABEL_SPEC_HASH.to_string(), spec_hash);
    labels.insert(LABEL_UPDATE_HASH.to_string(), update_hash);

    let mut metadata = dependent_meta(group, pod_name, labels);
    if !template.annotations.is_empty() {
        metadata.annotations = Some(template.annotations.clone());
    }

    Ok(Pod {
        metadata,
        spec: Some(spec),
        status: None,
    })
}

/// Split a pod spec into restart-only and in-place-mutable halves and hash each
fn pod_hashes(spec: &PodSpec) -> Result<(String, String), Error> {
    let mut restart_only = spec.clone();
    let mut mutable = Vec::with_capacity(spec.containers.len());
    for container in &mut restart_only.containers {
        mutable.push((container.resources.take(), container.readiness_probe.take()));
    }
    let spec_hash = deterministic_hash(&serde_json::to_vec(&restart_only)?);
    let update_hash = deterministic_hash(&serde_json::to_vec(&mutable)?);
    Ok((spec_hash, update_hash))
}

/// Build the ConfigMap carrying the configuration for `ordinal`
pub fn build_member_config_map(
    group: &MemberGroup,
    ordinal: i32,
    template: &MemberTemplate,
    config_hash: &str,
) -> ConfigMap {
    let mut labels = identity_labels(group, ordinal);
    labels.insert(LABEL_CONFIG_HASH.to_string(), config_hash.to_string());
    ConfigMap {
        metadata: dependent_meta(group, config_map_name(group, ordinal), labels),
        data: Some(BTreeMap::from([(
            CONFIG_FILE_NAME.to_string(),
            template.config.clone(),
        )])),
        ..Default::default()
    }
}

/// Build one claim per template volume for `ordinal`
pub fn build_member_pvcs(
    group: &MemberGroup,
    ordinal: i32,
    template: &MemberTemplate,
) -> Vec<PersistentVolumeClaim> {
    template
        .volumes
        .iter()
        .map(|vol| PersistentVolumeClaim {
            metadata: dependent_meta(
                group,
                pvc_name(group, ordinal, &vol.name),
                identity_labels(group, ordinal),
            ),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: vol.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(vol.storage.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MemberGroupSpec, TlsSpec, VolumeSpec};

    fn group() -> MemberGroup {
        let mut group = MemberGroup::new(
            "pd",
            MemberGroupSpec {
                replicas: 3,
                template: serde_json::from_value(serde_json::json!({
                    "image": "registry.local/member",
                    "version": "v8.1.0",
                    "config": "[log]\nlevel = \"info\"\n",
                    "volumes": [{"name": "data", "path": "/var/lib/member", "storage": "10Gi"}]
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
        group.metadata.uid = Some("uid-1".to_string());
        group
    }

    fn container(pod: &Pod) -> &Container {
        &pod.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn pod_identity_and_labels() {
        let g = group();
        let pod = build_member_pod(&g, 1, &g.spec.template, "cfg", "rev").unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("pd-1"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("tidb"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_GROUP], "pd");
        assert_eq!(labels[LABEL_ORDINAL], "1");
        assert_eq!(labels[LABEL_CONFIG_HASH], "cfg");
        assert_eq!(labels[LABEL_REVISION], "rev");
        assert!(labels.contains_key(LABEL_SPEC_HASH));
        assert!(labels.contains_key(LABEL_UPDATE_HASH));

        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "MemberGroup");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.hostname.as_deref(), Some("pd-1"));
        assert_eq!(spec.subdomain.as_deref(), Some("pd-peer"));
    }

    #[test]
    fn pod_wires_config_volumes_and_probe() {
        let g = group();
        let pod = build_member_pod(&g, 0, &g.spec.template, "cfg", "rev").unwrap();
        let c = container(&pod);

        assert_eq!(c.image.as_deref(), Some("registry.local/member:v8.1.0"));
        assert_eq!(
            c.command.as_ref().unwrap(),
            &vec![
                "/member-server".to_string(),
                "--config".to_string(),
                "/etc/member/config.toml".to_string()
            ]
        );
        let probe = c.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.tcp_socket.as_ref().unwrap().port,
            IntOrString::Int(2379)
        );
        assert_eq!(probe.initial_delay_seconds, Some(5));

        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, "pd-0");
        assert_eq!(
            volumes[1].persistent_volume_claim.as_ref().unwrap().claim_name,
            "pd-0-data"
        );
    }

    #[test]
    fn tls_injects_secret_volumes() {
        let mut g = group();
        g.spec.tls = Some(TlsSpec {
            enabled: true,
            mount_client_secret: true,
            ..Default::default()
        });
        let pod = build_member_pod(&g, 0, &g.spec.template, "cfg", "rev").unwrap();
        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        let secrets: Vec<_> = volumes
            .iter()
            .filter_map(|v| v.secret.as_ref()?.secret_name.clone())
            .collect();
        assert_eq!(
            secrets,
            vec!["pd-cluster-secret", "pd-cluster-client-secret"]
        );
        let mounts = container(&pod).volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == TLS_MOUNT_PATH));
        assert!(mounts.iter().any(|m| m.mount_path == CLIENT_TLS_MOUNT_PATH));
    }

    #[test]
    fn resource_change_moves_only_the_update_hash() {
        let g = group();
        let before = build_member_pod(&g, 0, &g.spec.template, "cfg", "rev").unwrap();
        let mut template = g.spec.template.clone();
        template.resources.cpu = Some("2".to_string());
        let after = build_member_pod(&g, 0, &template, "cfg", "rev").unwrap();

        let b = before.metadata.labels.unwrap();
        let a = after.metadata.labels.unwrap();
        assert_eq!(b[LABEL_SPEC_HASH], a[LABEL_SPEC_HASH]);
        assert_ne!(b[LABEL_UPDATE_HASH], a[LABEL_UPDATE_HASH]);
    }

    #[test]
    fn image_change_moves_the_spec_hash() {
        let g = group();
        let before = build_member_pod(&g, 0, &g.spec.template, "cfg", "rev").unwrap();
        let mut template = g.spec.template.clone();
        template.version = "v8.2.0".to_string();
        let after = build_member_pod(&g, 0, &template, "cfg", "rev").unwrap();
        assert_ne!(
            before.metadata.labels.unwrap()[LABEL_SPEC_HASH],
            after.metadata.labels.unwrap()[LABEL_SPEC_HASH]
        );
    }

    #[test]
    fn dependents_are_named_per_ordinal() {
        let mut g = group();
        g.spec.template.volumes.push(VolumeSpec {
            name: "wal".to_string(),
            path: "/var/lib/wal".to_string(),
            storage: "5Gi".to_string(),
            storage_class_name: Some("fast".to_string()),
        });

        let cm = build_member_config_map(&g, 2, &g.spec.template, "cfg");
        assert_eq!(cm.metadata.name.as_deref(), Some("pd-2"));
        assert_eq!(
            cm.data.unwrap()[CONFIG_FILE_NAME],
            "[log]\nlevel = \"info\"\n"
        );

        let pvcs = build_member_pvcs(&g, 2, &g.spec.template);
        let names: Vec<_> = pvcs
            .iter()
            .map(|p| p.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["pd-2-data", "pd-2-wal"]);
        assert_eq!(
            pvcs[1].spec.as_ref().unwrap().storage_class_name.as_deref(),
            Some("fast")
        );
    }
}
