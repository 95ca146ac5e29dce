//! kubeguard client: the resource client interface and its implementations.
//!
//! [`Client`] mirrors a full read/write resource client. [`ReadOnlyClient`]
//! decorates any client so that mutating calls never reach it, including
//! through sub-resource handles. [`MemoryClient`] and [`KubeClient`] are the
//! delegates shipped here.

#![forbid(unsafe_code)]

pub mod live;
pub mod memory;
pub mod readonly;

use std::fmt;
use std::sync::Arc;

use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kubeguard_codec::{to_dynamic, to_typed, ConversionError};
use kubeguard_core::{gvk_key, Object, Registry, RegistryError};
use serde_json::Value as Json;

pub use live::KubeClient;
pub use memory::MemoryClient;
pub use readonly::{ReadOnlyClient, ReadOnlySubResourceClient, WritePolicy};

/// Mutating operations of the client surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Patch,
    Delete,
    DeleteAllOf,
}

impl Operation {
    pub const ALL: [Operation; 5] =
        [Operation::Create, Operation::Update, Operation::Patch, Operation::Delete, Operation::DeleteAllOf];

    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "Create",
            Operation::Update => "Update",
            Operation::Patch => "Patch",
            Operation::Delete => "Delete",
            Operation::DeleteAllOf => "DeleteAllOf",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0} not allowed in read-only mode")]
    WriteDenied(Operation),
    #[error("client has no delegate")]
    NoDelegate,
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },
    #[error("{kind} {key}: resourceVersion {given} is stale, current is {current}")]
    Conflict { kind: String, key: ObjectKey, given: String, current: String },
    #[error("no resource mapping for {0}")]
    NoMapping(String),
    #[error("object has no apiVersion/kind")]
    MissingKind,
    #[error("object has no name")]
    MissingName,
    #[error("namespace required for namespaced kind {0}")]
    NamespaceRequired(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Namespace and name of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn of(obj: &Object) -> ClientResult<Self> {
        let name = obj.name().filter(|n| !n.is_empty()).ok_or(ClientError::MissingName)?;
        Ok(Self { namespace: obj.namespace().filter(|n| !n.is_empty()).map(str::to_string), name: name.to_string() })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Scope of a list or a delete-collection call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// `None` lists across all namespaces.
    pub namespace: Option<String>,
    /// Equality-based label selector, e.g. `app=web,tier!=db`.
    pub label_selector: Option<String>,
}

impl ListOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), ..Default::default() }
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn to_list_params(&self) -> ListParams {
        let lp = ListParams::default();
        match &self.label_selector {
            Some(sel) => lp.labels(sel),
            None => lp,
        }
    }
}

/// REST mapping of a kind: its resource and scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMapping {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Full read/write resource client.
///
/// Writes update `obj` in place with the object as stored.
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> ClientResult<Object>;
    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>>;

    async fn create(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()>;
    async fn update(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()>;
    async fn patch(&self, obj: &mut Object, patch: &Patch<Json>, pp: &PatchParams) -> ClientResult<()>;
    async fn delete(&self, obj: &Object, dp: &DeleteParams) -> ClientResult<()>;
    async fn delete_all_of(&self, gvk: &GroupVersionKind, opts: &ListOptions, dp: &DeleteParams) -> ClientResult<()>;

    /// Handle on the named sub-resource of this client's objects.
    fn sub_resource(&self, name: &str) -> Box<dyn SubResourceClient>;

    fn status(&self) -> Box<dyn SubResourceClient> {
        self.sub_resource("status")
    }

    fn registry(&self) -> ClientResult<Arc<dyn Registry>>;
    async fn resolve_mapping(&self, gvk: &GroupVersionKind) -> ClientResult<ResourceMapping>;
    fn group_version_kind_for(&self, obj: &Object) -> ClientResult<GroupVersionKind>;
    async fn is_object_namespaced(&self, obj: &Object) -> ClientResult<bool>;
}

/// Sub-resource handle: reads plus the narrower write surface.
#[async_trait::async_trait]
pub trait SubResourceClient: Send + Sync {
    async fn get(&self, obj: &Object) -> ClientResult<Object>;
    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>>;

    /// Create `sub` against the sub-resource of `obj`; `sub` receives the response.
    async fn create(&self, obj: &Object, sub: &mut Object, pp: &PostParams) -> ClientResult<()>;
    async fn update(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()>;
    async fn patch(&self, obj: &mut Object, patch: &Patch<Json>, pp: &PatchParams) -> ClientResult<()>;
}

/// Kind of an object: its recorded header, else the first registered kind of its type.
pub fn resolve_gvk(registry: &dyn Registry, obj: &Object) -> ClientResult<GroupVersionKind> {
    match obj {
        Object::Typed(t) if t.recorded_types().is_none() => {
            registry.object_kinds(t.resource())?.into_iter().next().ok_or(ClientError::MissingKind)
        }
        _ => obj.gvk().filter(|g| !g.version.is_empty() && !g.kind.is_empty()).ok_or(ClientError::MissingKind),
    }
}

pub(crate) fn into_dynamic(registry: &dyn Registry, obj: &Object) -> ClientResult<DynamicObject> {
    let gvk = resolve_gvk(registry, obj)?;
    let mut out = to_dynamic(registry, [obj.clone()])?;
    let mut d = out.pop().ok_or(ClientError::MissingKind)?;
    d.types = Some(kube::core::TypeMeta { api_version: gvk.api_version(), kind: gvk.kind });
    Ok(d)
}

/// Replace `obj` with the stored form, keeping its representation.
pub(crate) fn write_back(registry: &dyn Registry, obj: &mut Object, stored: DynamicObject) -> ClientResult<()> {
    *obj = if obj.is_dynamic() {
        Object::Dynamic(stored)
    } else {
        to_typed(registry, [Object::Dynamic(stored)])?.pop().ok_or(ClientError::MissingKind)?
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubeguard_core::Scheme;

    #[test]
    fn denial_message_names_the_operation() {
        for op in Operation::ALL {
            let msg = ClientError::WriteDenied(op).to_string();
            assert_eq!(msg, format!("{} not allowed in read-only mode", op.as_str()));
        }
    }

    #[test]
    fn object_key_requires_a_name() {
        let cm = Object::typed(ConfigMap {
            metadata: ObjectMeta { name: Some("a".into()), namespace: Some("ns".into()), ..Default::default() },
            ..Default::default()
        });
        let key = ObjectKey::of(&cm).unwrap();
        assert_eq!(key, ObjectKey::new("ns", "a"));
        assert_eq!(key.to_string(), "ns/a");
        assert!(matches!(ObjectKey::of(&Object::typed(ConfigMap::default())), Err(ClientError::MissingName)));
    }

    #[test]
    fn resolve_gvk_prefers_the_recorded_header() {
        let scheme = Scheme::with_builtins();
        let gvk = resolve_gvk(&scheme, &Object::typed(ConfigMap::default())).unwrap();
        assert_eq!(gvk_key(&gvk), "v1/ConfigMap");

        let d: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" }
        }))
        .unwrap();
        assert_eq!(gvk_key(&resolve_gvk(&scheme, &Object::Dynamic(d)).unwrap()), "example.com/v1/Widget");
    }

    #[test]
    fn list_options_carry_the_selector() {
        let lp = ListOptions::in_namespace("ns").labels("app=web").to_list_params();
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
    }
}
