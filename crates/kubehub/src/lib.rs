//! Apiary kubehub: the declarative store, secret lookup and change feed backed by
//! the Kubernetes API.

#![forbid(unsafe_code)]

pub mod convert;
pub mod secrets;
pub mod watch;

use apiary_core::{manifest, ApiaryError, ApiaryResult, Kind, Resource, ResourceId, API_GROUP, API_VERSION};
use apiary_store::ObjectStore;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tracing::debug;

pub use secrets::KubeSecrets;
pub use watch::{spawn_watchers, watch_kind};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "apiary";

/// API resource for one kind: custom resources in the apiary group, secrets in core v1.
pub fn api_resource(kind: Kind) -> ApiResource {
    let gvk = match kind {
        Kind::Secret => GroupVersionKind::gvk("", "v1", "Secret"),
        other => GroupVersionKind::gvk(API_GROUP, API_VERSION, other.as_str()),
    };
    ApiResource::from_gvk(&gvk)
}

/// Dynamic API handle scoped to `namespace`, or cluster wide when `None`.
pub fn dynamic_api(client: &Client, kind: Kind, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = api_resource(kind);
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    }
}

/// `ObjectStore` over the API server. Listing is limited to `watch_namespace` when set.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    watch_namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self { Self { client, watch_namespace } }

    fn api(&self, id: &ResourceId) -> Api<DynamicObject> {
        dynamic_api(&self.client, id.kind, Some(&id.key.namespace))
    }

    async fn merge(&self, obj: &Resource, call: &str, patch: serde_json::Value, status: bool) -> ApiaryResult<Resource> {
        let id = obj.id();
        let api = self.api(&id);
        let pp = PatchParams::default();
        let res = if status {
            api.patch_status(&id.key.name, &pp, &Patch::Merge(&patch)).await
        } else {
            api.patch(&id.key.name, &pp, &Patch::Merge(&patch)).await
        };
        let updated = res.map_err(|e| convert::map_error(e, call, &id))?;
        debug!(id = %id, call, rv = ?updated.metadata.resource_version, "kubehub: patched");
        convert::decode(id.kind, &updated)
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, id: &ResourceId) -> ApiaryResult<Option<Resource>> {
        let found = self.api(id).get_opt(&id.key.name).await.map_err(|e| convert::map_error(e, "get", id))?;
        found.map(|o| convert::decode(id.kind, &o)).transpose()
    }

    async fn list(&self, kind: Kind) -> ApiaryResult<Vec<Resource>> {
        let api = dynamic_api(&self.client, kind, self.watch_namespace.as_deref());
        let scope = ResourceId::new(kind, self.watch_namespace.clone().unwrap_or_default(), "*");
        let list = api.list(&ListParams::default()).await.map_err(|e| convert::map_error(e, "list", &scope))?;
        let mut out = list.items.iter().map(|o| convert::decode(kind, o)).collect::<ApiaryResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn apply(&self, obj: &Resource) -> ApiaryResult<Resource> {
        let id = obj.id();
        let doc = manifest::to_manifest(obj)?;
        let applied = self
            .api(&id)
            .patch(&id.key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&doc))
            .await
            .map_err(|e| convert::map_error(e, "apply", &id))?;
        convert::decode(id.kind, &applied)
    }

    async fn delete(&self, id: &ResourceId) -> ApiaryResult<bool> {
        let res = self
            .api(id)
            .delete(&id.key.name, &DeleteParams::default())
            .await
            .map_err(|e| convert::map_error(e, "delete", id))?;
        // Left: the object is still there with a deletion timestamp set.
        Ok(res.is_right())
    }

    async fn update_status(&self, obj: &Resource) -> ApiaryResult<Resource> {
        if obj.kind() == Kind::Secret {
            return Err(ApiaryError::Internal(format!("{} has no status subresource", obj.id())));
        }
        self.merge(obj, "status", convert::status_patch(obj)?, true).await
    }

    async fn update_finalizers(&self, obj: &Resource) -> ApiaryResult<Resource> {
        self.merge(obj, "finalizers", convert::finalizer_patch(obj), false).await
    }
}
