//! Type registry: maps `k8s-openapi` types to group/version/kind and performs
//! canonical decode/encode of resource documents.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tracing::debug;

use crate::{gvk_from_types, stamp_types, Object, TypedObject, TypedResource};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document is not an object")]
    NotAnObject,
    #[error("Object 'apiVersion' is missing in document")]
    MissingApiVersion,
    #[error("Object 'Kind' is missing in document")]
    MissingKind,
    #[error("no kind {kind:?} is registered for version {api_version:?}")]
    NotRegistered { api_version: String, kind: String },
    #[error("no kind is registered for the type {0}")]
    UnregisteredType(&'static str),
    #[error("strict decoding error: unknown field {field:?} in {kind}")]
    Strict { kind: String, field: String },
}

/// What a document should be decoded into.
#[derive(Debug, Clone, Copy)]
pub enum DecodeTarget<'a> {
    /// Untyped tree; only `apiVersion` and `kind` are required.
    Dynamic,
    /// The registered type named by the document header.
    Registered,
    /// The concrete type of the given prototype; a missing header defaults to
    /// the prototype's, a different registered header wins over it.
    Like(&'a TypedObject),
}

/// Output format of [`Registry::encode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub yaml: bool,
    pub pretty: bool,
    /// Reject content that would not survive a round trip through its registered type.
    pub strict: bool,
}

impl EncodeOptions {
    /// Human-readable, pretty, strict YAML: the document stream format.
    pub const fn canonical_yaml() -> Self {
        Self { yaml: true, pretty: true, strict: true }
    }
}

/// Kind resolution and canonical (de)serialization of resource objects.
pub trait Registry: Send + Sync {
    /// Kinds registered for the concrete type of `obj`, preferred first.
    fn object_kinds(&self, obj: &dyn TypedResource) -> Result<Vec<GroupVersionKind>, RegistryError>;

    /// Scope of a registered kind; `None` when the kind is unknown.
    fn is_namespaced(&self, gvk: &GroupVersionKind) -> Option<bool>;

    fn decode(&self, data: &[u8], target: DecodeTarget<'_>) -> Result<Object, RegistryError>;

    /// Encode using the object's own header; never converts versions.
    fn encode(&self, obj: &Object, opts: &EncodeOptions) -> Result<Vec<u8>, RegistryError>;
}

/// Scope marker of a `k8s-openapi` resource, resolved at registration.
pub trait ScopeKind {
    const NAMESPACED: bool;
}

impl ScopeKind for NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl ScopeKind for ClusterResourceScope {
    const NAMESPACED: bool = false;
}

type DecodeFn = fn(Json) -> serde_json::Result<Box<dyn TypedResource>>;

#[derive(Clone)]
struct Registration {
    /// Header the Rust type itself serializes with.
    native: TypeMeta,
    namespaced: bool,
    decode: DecodeFn,
}

fn decode_as<K>(value: Json) -> serde_json::Result<Box<dyn TypedResource>>
where
    K: TypedResource + DeserializeOwned,
{
    serde_json::from_value::<K>(value).map(|k| Box::new(k) as Box<dyn TypedResource>)
}

/// In-process registry of `k8s-openapi` types.
#[derive(Clone, Default)]
pub struct Scheme {
    kinds: HashMap<GroupVersionKind, Registration>,
    types: HashMap<TypeId, Vec<GroupVersionKind>>,
}

impl fmt::Debug for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheme").field("kinds", &self.kinds.len()).finish()
    }
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme with the commonly used built-in API groups.
    pub fn with_builtins() -> Self {
        use k8s_openapi::api::{apps::v1 as apps, batch::v1 as batch, core::v1 as core, networking::v1 as net, rbac::v1 as rbac};
        use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiext;

        let mut s = Self::new();
        s.register::<core::Namespace>()
            .register::<core::Pod>()
            .register::<core::ConfigMap>()
            .register::<core::Secret>()
            .register::<core::Service>()
            .register::<core::ServiceAccount>()
            .register::<core::Endpoints>()
            .register::<core::Event>()
            .register::<core::Node>()
            .register::<core::PersistentVolume>()
            .register::<core::PersistentVolumeClaim>()
            .register::<apps::Deployment>()
            .register::<apps::StatefulSet>()
            .register::<apps::DaemonSet>()
            .register::<apps::ReplicaSet>()
            .register::<batch::Job>()
            .register::<batch::CronJob>()
            .register::<net::Ingress>()
            .register::<net::NetworkPolicy>()
            .register::<rbac::Role>()
            .register::<rbac::RoleBinding>()
            .register::<rbac::ClusterRole>()
            .register::<rbac::ClusterRoleBinding>()
            .register::<apiext::CustomResourceDefinition>();
        s
    }

    /// Register `K` under its own group/version/kind.
    pub fn register<K>(&mut self) -> &mut Self
    where
        K: TypedResource + kube::Resource<DynamicType = ()> + DeserializeOwned,
        <K as kube::Resource>::Scope: ScopeKind,
    {
        let native = TypeMeta { api_version: K::api_version(&()).into_owned(), kind: K::kind(&()).into_owned() };
        let gvk = gvk_from_types(&native);
        self.register_as::<K>(gvk)
    }

    /// Register `K` under an additional group/version/kind. Documents with that
    /// header decode into `K` and keep the header they were read with.
    pub fn register_as<K>(&mut self, gvk: GroupVersionKind) -> &mut Self
    where
        K: TypedResource + kube::Resource<DynamicType = ()> + DeserializeOwned,
        <K as kube::Resource>::Scope: ScopeKind,
    {
        let native = TypeMeta { api_version: K::api_version(&()).into_owned(), kind: K::kind(&()).into_owned() };
        let reg = Registration { native, namespaced: <<K as kube::Resource>::Scope as ScopeKind>::NAMESPACED, decode: decode_as::<K> };
        let kinds = self.types.entry(TypeId::of::<K>()).or_default();
        if !kinds.contains(&gvk) {
            kinds.push(gvk.clone());
        }
        self.kinds.insert(gvk, reg);
        self
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains_key(gvk)
    }

    fn registration(&self, types: &TypeMeta) -> Result<&Registration, RegistryError> {
        self.kinds.get(&gvk_from_types(types)).ok_or_else(|| RegistryError::NotRegistered {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
        })
    }

    fn decode_typed(&self, mut value: Json, types: TypeMeta) -> Result<Object, RegistryError> {
        let reg = self.registration(&types)?;
        // k8s-openapi checks apiVersion/kind against its own constants
        stamp_types(&mut value, &reg.native);
        let inner = (reg.decode)(value)?;
        debug!(api_version = %types.api_version, kind = %types.kind, ty = inner.type_name(), "decoded typed object");
        Ok(Object::Typed(TypedObject::with_types(inner, types)))
    }

    /// Fail when `value` carries fields its registered type would drop.
    fn check_round_trip(&self, reg: &Registration, value: &Json, kind: &str) -> Result<(), RegistryError> {
        let mut probe = value.clone();
        stamp_types(&mut probe, &reg.native);
        let canonical = (reg.decode)(probe.clone())?.to_json()?;
        match first_dropped_field(&probe, &canonical, "") {
            Some(field) => Err(RegistryError::Strict { kind: kind.to_string(), field }),
            None => Ok(()),
        }
    }
}

impl Registry for Scheme {
    fn object_kinds(&self, obj: &dyn TypedResource) -> Result<Vec<GroupVersionKind>, RegistryError> {
        self.types.get(&obj.type_key()).cloned().ok_or(RegistryError::UnregisteredType(obj.type_name()))
    }

    fn is_namespaced(&self, gvk: &GroupVersionKind) -> Option<bool> {
        self.kinds.get(gvk).map(|r| r.namespaced)
    }

    fn decode(&self, data: &[u8], target: DecodeTarget<'_>) -> Result<Object, RegistryError> {
        let value: Json = serde_yaml::from_slice(data)?;
        if !value.is_object() {
            return Err(RegistryError::NotAnObject);
        }
        match target {
            DecodeTarget::Dynamic => decode_dynamic(value),
            DecodeTarget::Registered => {
                let types = header(&value)?;
                self.decode_typed(value, types)
            }
            DecodeTarget::Like(proto) => {
                let fallback = proto.types();
                let types = match header(&value) {
                    Ok(t) => t,
                    Err(RegistryError::MissingApiVersion | RegistryError::MissingKind) => TypeMeta {
                        api_version: str_field(&value, "apiVersion").unwrap_or(fallback.api_version.as_str()).to_string(),
                        kind: str_field(&value, "kind").unwrap_or(fallback.kind.as_str()).to_string(),
                    },
                    Err(e) => return Err(e),
                };
                self.decode_typed(value, types)
            }
        }
    }

    fn encode(&self, obj: &Object, opts: &EncodeOptions) -> Result<Vec<u8>, RegistryError> {
        let types = obj.types().ok_or(RegistryError::MissingKind)?;
        if types.api_version.is_empty() {
            return Err(RegistryError::MissingApiVersion);
        }
        if types.kind.is_empty() {
            return Err(RegistryError::MissingKind);
        }
        let value = obj.to_json()?;
        if opts.strict {
            match obj {
                Object::Typed(t) => {
                    let reg = self
                        .object_kinds(t.resource())?
                        .first()
                        .and_then(|gvk| self.kinds.get(gvk))
                        .ok_or(RegistryError::UnregisteredType(t.resource().type_name()))?;
                    self.check_round_trip(reg, &value, &types.kind)?;
                }
                // schema-less kinds have nothing to check against
                Object::Dynamic(_) => {
                    if let Ok(reg) = self.registration(&types) {
                        self.check_round_trip(reg, &value, &types.kind)?;
                    }
                }
            }
        }
        let mut out = if opts.yaml {
            serde_yaml::to_string(&value)?.into_bytes()
        } else if opts.pretty {
            serde_json::to_vec_pretty(&value)?
        } else {
            serde_json::to_vec(&value)?
        };
        if !opts.yaml {
            out.push(b'\n');
        }
        Ok(out)
    }
}

fn str_field<'a>(value: &'a Json, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn header(value: &Json) -> Result<TypeMeta, RegistryError> {
    let api_version = str_field(value, "apiVersion").ok_or(RegistryError::MissingApiVersion)?;
    let kind = str_field(value, "kind").ok_or(RegistryError::MissingKind)?;
    Ok(TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() })
}

fn decode_dynamic(value: Json) -> Result<Object, RegistryError> {
    let types = header(&value)?;
    let mut obj: DynamicObject = serde_json::from_value(value)?;
    obj.types = Some(types);
    Ok(Object::Dynamic(obj))
}

/// First path present (non-null) in `src` but missing from `canonical`.
fn first_dropped_field(src: &Json, canonical: &Json, path: &str) -> Option<String> {
    match (src, canonical) {
        (Json::Object(s), Json::Object(c)) => s.iter().filter(|(_, v)| !v.is_null()).find_map(|(k, sv)| {
            let p = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
            match c.get(k) {
                Some(cv) => first_dropped_field(sv, cv, &p),
                None => Some(p),
            }
        }),
        (Json::Array(s), Json::Array(c)) => s
            .iter()
            .zip(c)
            .enumerate()
            .find_map(|(i, (sv, cv))| first_dropped_field(sv, cv, &format!("{path}[{i}]"))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const CONFIG_MAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: ns\ndata:\n  k: v\n";

    #[test]
    fn dynamic_decode_requires_a_header() {
        let s = Scheme::new();
        let o = s.decode(CONFIG_MAP.as_bytes(), DecodeTarget::Dynamic).unwrap();
        let d = o.as_dynamic().expect("dynamic");
        assert_eq!(d.types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(d.data["data"]["k"], "v");

        let e = s.decode(b"apiVersion: v1\nmetadata:\n  name: x\n", DecodeTarget::Dynamic).unwrap_err();
        assert!(matches!(e, RegistryError::MissingKind), "{e}");
        let e = s.decode(b"kind: Pod\n", DecodeTarget::Dynamic).unwrap_err();
        assert!(matches!(e, RegistryError::MissingApiVersion), "{e}");
        let e = s.decode(b"- a\n- b\n", DecodeTarget::Dynamic).unwrap_err();
        assert!(matches!(e, RegistryError::NotAnObject), "{e}");
    }

    #[test]
    fn registered_decode_picks_type_from_header() {
        let s = Scheme::with_builtins();
        let o = s.decode(CONFIG_MAP.as_bytes(), DecodeTarget::Registered).unwrap();
        let t = o.as_typed().expect("typed");
        let cm = t.downcast_ref::<ConfigMap>().expect("configmap");
        assert_eq!(cm.data.as_ref().unwrap()["k"], "v");
        assert_eq!(t.recorded_types().unwrap().kind, "ConfigMap");

        let e = s.decode(b"apiVersion: example.com/v1\nkind: Widget\n", DecodeTarget::Registered).unwrap_err();
        assert!(matches!(e, RegistryError::NotRegistered { .. }), "{e}");
    }

    #[test]
    fn prototype_fills_a_missing_header() {
        let s = Scheme::with_builtins();
        let proto = TypedObject::new(Pod::default());
        let o = s.decode(b"metadata:\n  name: p\n", DecodeTarget::Like(&proto)).unwrap();
        let t = o.as_typed().unwrap();
        assert_eq!(t.downcast_ref::<Pod>().unwrap().metadata.name.as_deref(), Some("p"));
        assert_eq!(t.types().kind, "Pod");

        // an explicit, registered header wins over the prototype
        let o = s.decode(CONFIG_MAP.as_bytes(), DecodeTarget::Like(&proto)).unwrap();
        assert!(o.as_typed().unwrap().downcast_ref::<ConfigMap>().is_some());
    }

    #[test]
    fn aliases_decode_into_the_type_and_keep_their_header() {
        let mut s = Scheme::with_builtins();
        let legacy = GroupVersionKind { group: "extensions".into(), version: "v1beta1".into(), kind: "Deployment".into() };
        s.register_as::<Deployment>(legacy.clone());

        let doc = b"apiVersion: extensions/v1beta1\nkind: Deployment\nmetadata:\n  name: web\n";
        let o = s.decode(doc, DecodeTarget::Registered).unwrap();
        assert!(o.as_typed().unwrap().downcast_ref::<Deployment>().is_some());
        assert_eq!(o.gvk().unwrap(), legacy);

        let out = String::from_utf8(s.encode(&o, &EncodeOptions::canonical_yaml()).unwrap()).unwrap();
        assert!(out.starts_with("apiVersion: extensions/v1beta1\nkind: Deployment\n"), "{out}");

        let kinds = s.object_kinds(&Deployment::default()).unwrap();
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0].group, "apps");
    }

    #[test]
    fn object_kinds_fails_for_unregistered_types() {
        let s = Scheme::new();
        let e = s.object_kinds(&Namespace::default()).unwrap_err();
        assert!(matches!(e, RegistryError::UnregisteredType(_)), "{e}");
    }

    #[test]
    fn scope_is_recorded_at_registration() {
        let s = Scheme::with_builtins();
        let ns = GroupVersionKind { group: String::new(), version: "v1".into(), kind: "Namespace".into() };
        let pod = GroupVersionKind { group: String::new(), version: "v1".into(), kind: "Pod".into() };
        assert_eq!(s.is_namespaced(&ns), Some(false));
        assert_eq!(s.is_namespaced(&pod), Some(true));
        assert_eq!(s.is_namespaced(&GroupVersionKind { group: "x".into(), version: "v1".into(), kind: "Y".into() }), None);
    }

    #[test]
    fn strict_encode_rejects_fields_the_registered_type_drops() {
        let s = Scheme::with_builtins();
        let bogus = s
            .decode(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\nbogus: 1\n", DecodeTarget::Dynamic)
            .unwrap();
        match s.encode(&bogus, &EncodeOptions::canonical_yaml()) {
            Err(RegistryError::Strict { kind, field }) => {
                assert_eq!(kind, "ConfigMap");
                assert_eq!(field, "bogus");
            }
            other => panic!("expected strict error, got {other:?}"),
        }
        // non-strict encoding keeps whatever the dynamic object carries
        let lax = EncodeOptions { strict: false, ..EncodeOptions::canonical_yaml() };
        assert!(s.encode(&bogus, &lax).is_ok());

        // unknown kinds are schema-less and pass
        let widget = s.decode(b"apiVersion: example.com/v1\nkind: Widget\nspec:\n  a: 1\n", DecodeTarget::Dynamic).unwrap();
        assert!(s.encode(&widget, &EncodeOptions::canonical_yaml()).is_ok());
    }

    #[test]
    fn typed_yaml_keeps_struct_field_order() {
        let s = Scheme::with_builtins();
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("cm".into()), ..Default::default() },
            data: Some([("k".to_string(), "v".to_string())].into()),
            ..Default::default()
        };
        let out = String::from_utf8(s.encode(&Object::typed(cm), &EncodeOptions::canonical_yaml()).unwrap()).unwrap();
        assert_eq!(out, "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\ndata:\n  k: v\n");
    }

    #[test]
    fn json_encoding_honours_pretty() {
        let s = Scheme::with_builtins();
        let o = Object::typed(Namespace { metadata: ObjectMeta { name: Some("n".into()), ..Default::default() }, ..Default::default() });
        let compact = s.encode(&o, &EncodeOptions::default()).unwrap();
        assert_eq!(compact, b"{\"apiVersion\":\"v1\",\"kind\":\"Namespace\",\"metadata\":{\"name\":\"n\"}}\n");
        let pretty = String::from_utf8(s.encode(&o, &EncodeOptions { pretty: true, ..Default::default() }).unwrap()).unwrap();
        assert!(pretty.contains("\n  \"kind\": \"Namespace\""), "{pretty}");
    }

    #[test]
    fn first_dropped_field_ignores_nulls_and_walks_arrays() {
        let src = serde_json::json!({ "a": null, "b": [{ "x": 1 }, { "y": 2 }] });
        let canon = serde_json::json!({ "b": [{ "x": 1 }, {}] });
        assert_eq!(first_dropped_field(&src, &canon, ""), Some("b[1].y".to_string()));
    }
}
