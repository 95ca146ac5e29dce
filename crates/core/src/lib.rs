//! kubeguard core: resource objects (typed and dynamic) and the type registry.

#![forbid(unsafe_code)]

pub mod registry;

use std::any::{Any, TypeId};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use serde::Serialize;
use serde_json::Value as Json;

pub use registry::{DecodeTarget, EncodeOptions, Registry, RegistryError, Scheme};

/// Object-safe view over a concrete `k8s-openapi` resource type.
///
/// Implemented for every `kube::Resource` with a static type, so any
/// `k8s_openapi::api::*` struct can be boxed into a [`TypedObject`].
pub trait TypedResource: fmt::Debug + Send + Sync + 'static {
    /// `apiVersion`/`kind` constants of the Rust type.
    fn static_types(&self) -> TypeMeta;
    fn object_meta(&self) -> &ObjectMeta;
    fn object_meta_mut(&mut self) -> &mut ObjectMeta;
    fn to_json(&self) -> serde_json::Result<Json>;
    fn clone_boxed(&self) -> Box<dyn TypedResource>;
    fn eq_dyn(&self, other: &dyn TypedResource) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn type_key(&self) -> TypeId;
    fn type_name(&self) -> &'static str;
}

impl<K> TypedResource for K
where
    K: kube::Resource<DynamicType = ()> + Serialize + Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn static_types(&self) -> TypeMeta {
        TypeMeta { api_version: K::api_version(&()).into_owned(), kind: K::kind(&()).into_owned() }
    }

    fn object_meta(&self) -> &ObjectMeta {
        kube::Resource::meta(self)
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        kube::Resource::meta_mut(self)
    }

    fn to_json(&self) -> serde_json::Result<Json> {
        serde_json::to_value(self)
    }

    fn clone_boxed(&self) -> Box<dyn TypedResource> {
        Box::new(self.clone())
    }

    fn eq_dyn(&self, other: &dyn TypedResource) -> bool {
        other.as_any().downcast_ref::<K>().map_or(false, |o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_key(&self) -> TypeId {
        TypeId::of::<K>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<K>()
    }
}

/// A registry-known resource plus the header it was decoded from.
#[derive(Debug)]
pub struct TypedObject {
    /// `None` for objects built in code; the type constants apply then.
    types: Option<TypeMeta>,
    inner: Box<dyn TypedResource>,
}

impl TypedObject {
    pub fn new<K: TypedResource>(value: K) -> Self {
        Self { types: None, inner: Box::new(value) }
    }

    /// Attach the header read from a document.
    pub fn with_types(inner: Box<dyn TypedResource>, types: TypeMeta) -> Self {
        Self { types: Some(types), inner }
    }

    /// Recorded header if any, else the Rust type's constants.
    pub fn types(&self) -> TypeMeta {
        self.types.clone().unwrap_or_else(|| self.inner.static_types())
    }

    pub fn recorded_types(&self) -> Option<&TypeMeta> {
        self.types.as_ref()
    }

    pub fn resource(&self) -> &dyn TypedResource {
        self.inner.as_ref()
    }

    pub fn resource_mut(&mut self) -> &mut dyn TypedResource {
        self.inner.as_mut()
    }

    pub fn downcast_ref<K: 'static>(&self) -> Option<&K> {
        self.inner.as_any().downcast_ref::<K>()
    }

    /// JSON form carrying the recorded `apiVersion`/`kind`.
    pub fn to_json(&self) -> serde_json::Result<Json> {
        let mut value = self.inner.to_json()?;
        if let Some(types) = &self.types {
            stamp_types(&mut value, types);
        }
        Ok(header_first(value))
    }
}

impl Clone for TypedObject {
    fn clone(&self) -> Self {
        Self { types: self.types.clone(), inner: self.inner.clone_boxed() }
    }
}

impl PartialEq for TypedObject {
    fn eq(&self, other: &Self) -> bool {
        self.types() == other.types() && self.inner.eq_dyn(other.inner.as_ref())
    }
}

/// A resource object: either a registry-known typed structure or a dynamic tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Typed(TypedObject),
    Dynamic(DynamicObject),
}

impl Object {
    pub fn typed<K: TypedResource>(value: K) -> Self {
        Object::Typed(TypedObject::new(value))
    }

    /// Header of the object; dynamic objects built by hand may lack one.
    pub fn types(&self) -> Option<TypeMeta> {
        match self {
            Object::Typed(t) => Some(t.types()),
            Object::Dynamic(d) => d.types.clone(),
        }
    }

    pub fn gvk(&self) -> Option<GroupVersionKind> {
        self.types().map(|t| gvk_from_types(&t))
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Object::Typed(t) => t.resource().object_meta(),
            Object::Dynamic(d) => &d.metadata,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Object::Dynamic(_))
    }

    pub fn as_dynamic(&self) -> Option<&DynamicObject> {
        match self {
            Object::Dynamic(d) => Some(d),
            Object::Typed(_) => None,
        }
    }

    pub fn as_typed(&self) -> Option<&TypedObject> {
        match self {
            Object::Typed(t) => Some(t),
            Object::Dynamic(_) => None,
        }
    }

    /// Unwrap the dynamic variant, handing the object back otherwise.
    pub fn into_dynamic(self) -> Result<DynamicObject, Self> {
        match self {
            Object::Dynamic(d) => Ok(d),
            other => Err(other),
        }
    }

    /// Name of the concrete representation, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Typed(t) => t.resource().type_name(),
            Object::Dynamic(_) => std::any::type_name::<DynamicObject>(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Json> {
        match self {
            Object::Typed(t) => t.to_json(),
            Object::Dynamic(d) => serde_json::to_value(d),
        }
    }
}

impl From<DynamicObject> for Object {
    fn from(d: DynamicObject) -> Self {
        Object::Dynamic(d)
    }
}

impl From<TypedObject> for Object {
    fn from(t: TypedObject) -> Self {
        Object::Typed(t)
    }
}

/// Split `apiVersion` into group and version (`v1` is the core group).
pub fn gvk_from_types(types: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    GroupVersionKind { group, version, kind: types.kind.clone() }
}

/// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Parse a `v1/Kind` or `group/v1/Kind` key.
pub fn parse_gvk_key(key: &str) -> Option<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Some(GroupVersionKind { group: String::new(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => None,
    }
}

/// Overwrite `apiVersion`/`kind` of a JSON object in place.
pub(crate) fn stamp_types(value: &mut Json, types: &TypeMeta) {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("apiVersion".into(), Json::String(types.api_version.clone()));
        obj.insert("kind".into(), Json::String(types.kind.clone()));
    }
}

/// Reorder an object so `apiVersion`, `kind` and `metadata` lead; other
/// fields keep their relative order.
fn header_first(value: Json) -> Json {
    const HEADER: [&str; 3] = ["apiVersion", "kind", "metadata"];
    let Json::Object(fields) = value else {
        return value;
    };
    let (mut header, rest): (Vec<_>, Vec<_>) = fields.into_iter().partition(|(k, _)| HEADER.contains(&k.as_str()));
    header.sort_by_key(|(k, _)| HEADER.iter().position(|h| h == k));
    Json::Object(header.into_iter().chain(rest).collect())
}
