//! `kube::Client`-backed delegate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kubeguard_core::{gvk_key, Object, Registry};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{
    into_dynamic, resolve_gvk, write_back, Client, ClientError, ClientResult, ListOptions, ObjectKey, ResourceMapping,
    SubResourceClient,
};

/// Delegate talking to an API server. Objects come back dynamic.
///
/// Discovered mappings are cached per kind for the life of the client and
/// shared by its clones.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
    registry: Arc<dyn Registry>,
    mappings: Arc<Mutex<HashMap<GroupVersionKind, ResourceMapping>>>,
}

impl KubeClient {
    pub fn new(client: kube::Client, registry: Arc<dyn Registry>) -> Self {
        Self { client, registry, mappings: Arc::default() }
    }

    /// Seed the mapping of a kind, skipping its discovery.
    pub fn with_mapping(self, gvk: GroupVersionKind, mapping: ResourceMapping) -> Self {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner).insert(gvk, mapping);
        self
    }

    pub async fn try_from_config(config: kube::Config, registry: Arc<dyn Registry>) -> ClientResult<Self> {
        let client = kube::Client::try_from(config)?;
        info!(version = ?client.apiserver_version().await.ok().map(|v| v.git_version), "kube client ready");
        Ok(Self::new(client, registry))
    }

    pub fn inner(&self) -> &kube::Client {
        &self.client
    }

    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> ClientResult<ResourceMapping> {
        if let Some(m) = self.mappings.lock().unwrap_or_else(PoisonError::into_inner).get(gvk) {
            return Ok(m.clone());
        }
        let m = self.discover(gvk).await?;
        debug!(gvk = %gvk_key(gvk), plural = %m.resource.plural, "kube: discovered");
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner).insert(gvk.clone(), m.clone());
        Ok(m)
    }

    async fn discover(&self, gvk: &GroupVersionKind) -> ClientResult<ResourceMapping> {
        let discovery = Discovery::new(self.client.clone()).filter(&[gvk.group.as_str()]).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok(ResourceMapping { resource: ar, namespaced });
                }
            }
        }
        Err(ClientError::NoMapping(gvk_key(gvk)))
    }

    /// Api handle for a kind; namespaced kinds without a namespace span all namespaces.
    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> ClientResult<Api<DynamicObject>> {
        let m = self.find_api_resource(gvk).await?;
        Ok(match namespace {
            Some(ns) if m.namespaced => Api::namespaced_with(self.client.clone(), ns, &m.resource),
            _ => Api::all_with(self.client.clone(), &m.resource),
        })
    }

    /// Api handle and name addressing an existing object.
    async fn api_for(&self, obj: &Object) -> ClientResult<(GroupVersionKind, Api<DynamicObject>, ObjectKey)> {
        let gvk = resolve_gvk(self.registry.as_ref(), obj)?;
        let m = self.find_api_resource(&gvk).await?;
        let key = ObjectKey::of(obj)?;
        let api = match (&key.namespace, m.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &m.resource),
            (None, true) => return Err(ClientError::NamespaceRequired(gvk_key(&gvk))),
            (_, false) => Api::all_with(self.client.clone(), &m.resource),
        };
        Ok((gvk, api, key))
    }
}

#[async_trait::async_trait]
impl Client for KubeClient {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> ClientResult<Object> {
        let m = self.find_api_resource(gvk).await?;
        let api: Api<DynamicObject> = match (&key.namespace, m.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &m.resource),
            (None, true) => return Err(ClientError::NamespaceRequired(gvk_key(gvk))),
            (_, false) => Api::all_with(self.client.clone(), &m.resource),
        };
        Ok(Object::Dynamic(api.get(&key.name).await?))
    }

    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>> {
        let api = self.api(gvk, opts.namespace.as_deref()).await?;
        let list = api.list(&opts.to_list_params()).await?;
        debug!(gvk = %gvk_key(gvk), count = list.items.len(), "kube: listed");
        Ok(list.items.into_iter().map(Object::Dynamic).collect())
    }

    async fn create(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()> {
        let (_, api, _) = self.api_for(obj).await?;
        let created = api.create(pp, &into_dynamic(self.registry.as_ref(), obj)?).await?;
        write_back(self.registry.as_ref(), obj, created)
    }

    async fn update(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()> {
        let (_, api, key) = self.api_for(obj).await?;
        let replaced = api.replace(&key.name, pp, &into_dynamic(self.registry.as_ref(), obj)?).await?;
        write_back(self.registry.as_ref(), obj, replaced)
    }

    async fn patch(&self, obj: &mut Object, patch: &Patch<Json>, pp: &PatchParams) -> ClientResult<()> {
        let (_, api, key) = self.api_for(obj).await?;
        let patched = api.patch(&key.name, pp, patch).await?;
        write_back(self.registry.as_ref(), obj, patched)
    }

    async fn delete(&self, obj: &Object, dp: &DeleteParams) -> ClientResult<()> {
        let (gvk, api, key) = self.api_for(obj).await?;
        api.delete(&key.name, dp).await?;
        debug!(gvk = %gvk_key(&gvk), key = %key, "kube: deleted");
        Ok(())
    }

    async fn delete_all_of(&self, gvk: &GroupVersionKind, opts: &ListOptions, dp: &DeleteParams) -> ClientResult<()> {
        let api = self.api(gvk, opts.namespace.as_deref()).await?;
        api.delete_collection(dp, &opts.to_list_params()).await?;
        Ok(())
    }

    fn sub_resource(&self, name: &str) -> Box<dyn SubResourceClient> {
        Box::new(KubeSubResource { client: self.clone(), name: name.to_string() })
    }

    fn registry(&self) -> ClientResult<Arc<dyn Registry>> {
        Ok(self.registry.clone())
    }

    async fn resolve_mapping(&self, gvk: &GroupVersionKind) -> ClientResult<ResourceMapping> {
        self.find_api_resource(gvk).await
    }

    fn group_version_kind_for(&self, obj: &Object) -> ClientResult<GroupVersionKind> {
        resolve_gvk(self.registry.as_ref(), obj)
    }

    async fn is_object_namespaced(&self, obj: &Object) -> ClientResult<bool> {
        let gvk = resolve_gvk(self.registry.as_ref(), obj)?;
        Ok(self.find_api_resource(&gvk).await?.namespaced)
    }
}

/// Sub-resource handle of a [`KubeClient`].
struct KubeSubResource {
    client: KubeClient,
    name: String,
}

#[async_trait::async_trait]
impl SubResourceClient for KubeSubResource {
    async fn get(&self, obj: &Object) -> ClientResult<Object> {
        let (_, api, key) = self.client.api_for(obj).await?;
        Ok(Object::Dynamic(api.get_subresource(&self.name, &key.name).await?))
    }

    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>> {
        let api = self.client.api(gvk, opts.namespace.as_deref()).await?;
        let items = api.list(&opts.to_list_params()).await?.items;
        // the status sub-resource serves the whole object
        if self.name == "status" {
            return Ok(items.into_iter().map(Object::Dynamic).collect());
        }
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let item = Object::Dynamic(item);
            out.push(self.get(&item).await?);
        }
        Ok(out)
    }

    async fn create(&self, obj: &Object, sub: &mut Object, pp: &PostParams) -> ClientResult<()> {
        let (_, api, key) = self.client.api_for(obj).await?;
        let body = serde_json::to_vec(&sub.to_json()?)?;
        let created: DynamicObject = api.create_subresource(&self.name, &key.name, pp, body).await?;
        *sub = Object::Dynamic(created);
        Ok(())
    }

    async fn update(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()> {
        let (_, api, key) = self.client.api_for(obj).await?;
        let body = serde_json::to_vec(&into_dynamic(self.client.registry.as_ref(), obj)?)?;
        let replaced = api.replace_subresource(&self.name, &key.name, pp, body).await?;
        write_back(self.client.registry.as_ref(), obj, replaced)
    }

    async fn patch(&self, obj: &mut Object, patch: &Patch<Json>, pp: &PatchParams) -> ClientResult<()> {
        let (_, api, key) = self.client.api_for(obj).await?;
        let patched = api.patch_subresource(&self.name, &key.name, pp, patch).await?;
        write_back(self.client.registry.as_ref(), obj, patched)
    }
}
