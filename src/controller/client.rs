//! Platform (Kubernetes API) operations used by the controller

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{MemberGroup, MemberGroupStatus};
use crate::Error;

/// Kubernetes operations the reconciliation pass performs
///
/// Mocked in unit tests and faked in memory by the integration tests; the
/// production implementation is [`KubePlatformClient`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// List pods in `namespace` matching the label `selector`
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Create or update a pod (server-side apply)
    async fn apply_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod; deleting a pod that is already gone succeeds
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create or update a ConfigMap (server-side apply)
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Create a claim unless it already exists; existing claims are left untouched
    async fn ensure_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error>;

    /// Write group status, guarded by `resource_version` when given
    ///
    /// A version mismatch surfaces as [`Error::Conflict`].
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &MemberGroupStatus,
    ) -> Result<(), Error>;
}

/// [`PlatformClient`] backed by a kube `Client`
pub struct KubePlatformClient {
    client: Client,
    field_manager: String,
}

impl KubePlatformClient {
    /// Create a client applying objects as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }
}

fn object_name(meta: &kube::api::ObjectMeta) -> Result<(&str, &str), Error> {
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| Error::validation("object has no name"))?;
    let namespace = meta
        .namespace
        .as_deref()
        .ok_or_else(|| Error::validation(format!("object {name} has no namespace")))?;
    Ok((namespace, name))
}

/// Status fields that are omitted when empty and must be nulled explicitly,
/// otherwise a merge patch would leave the previous value in place
const CLEARABLE_STATUS_FIELDS: &[&str] = &[
    "currentRevision",
    "updateRevision",
    "currentTemplate",
    "updateTemplate",
    "partition",
    "settledReplicas",
    "leader",
    "members",
    "conditions",
    "message",
    "observedGeneration",
];

/// Serialize status for a JSON merge patch
pub(crate) fn status_merge_body(status: &MemberGroupStatus) -> Result<serde_json::Value, Error> {
    let mut body = serde_json::to_value(status)?;
    if let Some(obj) = body.as_object_mut() {
        for field in CLEARABLE_STATUS_FIELDS {
            obj.entry(*field).or_insert(serde_json::Value::Null);
        }
    }
    Ok(body)
}

#[async_trait]
impl PlatformClient for KubePlatformClient {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn apply_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let (namespace, name) = object_name(&pod.metadata)?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .patch(name, &self.apply_params(), &Patch::Apply(pod))
            .await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %name, "pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let (namespace, name) = object_name(&config_map.metadata)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &self.apply_params(), &Patch::Apply(config_map))
            .await?;
        Ok(())
    }

    async fn ensure_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
        let (namespace, _) = object_name(&pvc.metadata)?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), pvc).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &MemberGroupStatus,
    ) -> Result<(), Error> {
        let api: Api<MemberGroup> = Api::namespaced(self.client.clone(), namespace);

        let mut patch = serde_json::json!({ "status": status_merge_body(status)? });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::Conflict(format!("MemberGroup {namespace}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
