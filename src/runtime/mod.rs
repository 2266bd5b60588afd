//! Kubernetes object access for graph nodes
//!
//! Composed objects are arbitrary kinds known only at runtime, so everything
//! goes through the dynamic API. The [`ObjectClient`] trait is the seam the
//! instance controller reconciles through; tests substitute a mock to drive
//! scenarios without a cluster.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::{Error, Result};

/// Field manager identifying Trellis in server-side apply
pub const FIELD_MANAGER: &str = "trellis";

/// Typed access to dynamically-typed cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Fetch an object, mapping 404 to `None`
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object from a rendered manifest
    async fn create(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Server-side apply a rendered manifest over an existing object
    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Replace the status subresource of an object
    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()>;

    /// Delete an object; already-gone is success
    async fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<()>;

    /// Install or update a CRD
    async fn install_crd(&self, crd: &CustomResourceDefinition) -> Result<()>;
}

/// [`ObjectClient`] backed by a real cluster connection
#[derive(Clone)]
pub struct KubeObjectClient {
    client: Client,
}

impl KubeObjectClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        match self.api(gvk, namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let obj: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| Error::serialization(format!("rendered manifest: {e}")))?;
        debug!(kind = %gvk.kind, namespace, "creating object");
        Ok(self.api(gvk, namespace).create(&PostParams::default(), &obj).await?)
    }

    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<DynamicObject> {
        debug!(kind = %gvk.kind, namespace, name, "applying object");
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .api(gvk, namespace)
            .patch(name, &params, &Patch::Apply(manifest))
            .await?)
    }

    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()> {
        let patch = serde_json::json!({"status": status});
        self.api(gvk, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<()> {
        match self.api(gvk, namespace).delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn install_crd(&self, crd: &CustomResourceDefinition) -> Result<()> {
        let name = crd
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("CRD has no name"))?;
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        debug!(name, "installing CRD");
        api.patch(name, &params, &Patch::Apply(crd)).await?;
        Ok(())
    }
}

/// True when every field of `desired` is present in `live` with an equal
/// value
///
/// The server decorates objects with defaults, managed fields, and status,
/// so equality is one-directional: the rendered manifest must be a subset of
/// the live object. Used to skip API writes on no-op reconcile passes.
pub fn manifest_matches(live: &serde_json::Value, desired: &serde_json::Value) -> bool {
    match (live, desired) {
        (serde_json::Value::Object(live), serde_json::Value::Object(desired)) => desired
            .iter()
            .all(|(key, value)| live.get(key).is_some_and(|l| manifest_matches(l, value))),
        (live, desired) => live == desired,
    }
}

/// True when the object opted out of deletion with the
/// `trellis.dev/deletion-policy: retain` annotation
pub fn retained(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(crate::crd::DELETION_POLICY_ANNOTATION))
        .is_some_and(|policy| policy == crate::crd::DELETION_POLICY_RETAIN)
}

/// Owner reference linking a composed object to its parent for cascade GC
pub fn owner_reference(
    api_version: &str,
    kind: &str,
    name: &str,
    uid: &str,
) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": api_version,
        "kind": kind,
        "name": name,
        "uid": uid,
        "controller": true,
    })
}

/// Insert an owner reference into a rendered manifest unless it already
/// declares one
pub fn attach_owner(manifest: &mut serde_json::Value, owner: &serde_json::Value) {
    if let Some(metadata) = manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        metadata
            .entry("ownerReferences")
            .or_insert_with(|| serde_json::json!([owner]));
    }
}

/// Extract the GroupVersionKind from a rendered manifest's
/// `apiVersion`/`kind` fields
pub fn manifest_gvk(manifest: &serde_json::Value) -> Result<GroupVersionKind> {
    let api_version = manifest
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::validation("manifest is missing apiVersion"))?;
    let kind = manifest
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::validation("manifest is missing kind"))?;

    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    Ok(GroupVersionKind::gvk(group, version, kind))
}

/// Extract `metadata.name` from a rendered manifest
pub fn manifest_name(manifest: &serde_json::Value) -> Result<String> {
    manifest
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::validation("manifest is missing metadata.name"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_gvk_core_and_grouped() {
        let core = serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap"});
        let gvk = manifest_gvk(&core).unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "ConfigMap");

        let grouped = serde_json::json!({"apiVersion": "apps/v1", "kind": "Deployment"});
        let gvk = manifest_gvk(&grouped).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn test_manifest_gvk_requires_fields() {
        assert!(manifest_gvk(&serde_json::json!({"kind": "ConfigMap"})).is_err());
        assert!(manifest_gvk(&serde_json::json!({"apiVersion": "v1"})).is_err());
    }

    /// Story: A live object with server-added fields still matches its
    /// manifest
    ///
    /// The apiserver adds uid, resourceVersion, and status; those must not
    /// make every reconcile pass look like drift.
    #[test]
    fn story_server_decorations_do_not_count_as_drift() {
        let desired = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg"},
            "data": {"host": "db.svc"}
        });
        let live = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "uid": "abc-123", "resourceVersion": "42"},
            "data": {"host": "db.svc"}
        });
        assert!(manifest_matches(&live, &desired));
    }

    /// Story: A changed field is drift
    #[test]
    fn story_changed_field_is_drift() {
        let desired = serde_json::json!({"data": {"host": "db-new.svc"}});
        let live = serde_json::json!({"data": {"host": "db.svc"}});
        assert!(!manifest_matches(&live, &desired));
    }

    #[test]
    fn test_attach_owner_respects_existing_references() {
        let owner = owner_reference("trellis.dev/v1alpha1", "WebApp", "shop", "uid-123");

        let mut manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg"}
        });
        attach_owner(&mut manifest, &owner);
        assert_eq!(manifest["metadata"]["ownerReferences"][0]["uid"], "uid-123");
        assert_eq!(manifest["metadata"]["ownerReferences"][0]["controller"], true);

        let mut declared = serde_json::json!({
            "metadata": {"ownerReferences": [{"uid": "other"}]}
        });
        attach_owner(&mut declared, &owner);
        assert_eq!(declared["metadata"]["ownerReferences"][0]["uid"], "other");
    }

    #[test]
    fn test_missing_field_is_drift() {
        let desired = serde_json::json!({"data": {"host": "db.svc", "port": "5432"}});
        let live = serde_json::json!({"data": {"host": "db.svc"}});
        assert!(!manifest_matches(&live, &desired));
    }
}
