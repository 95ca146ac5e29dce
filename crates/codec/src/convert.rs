//! Conversion between typed and dynamic resource objects.

use kube::core::{DynamicObject, TypeMeta};
use kubeguard_core::{DecodeTarget, Object, Registry, RegistryError};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("no kind is registered for the type {type_name}")]
    NoKinds { type_name: &'static str },
    #[error("object of type {type_name} is not dynamic")]
    NotDynamic { type_name: &'static str },
    #[error("kind {kind:?} of version {api_version:?} is not registered")]
    UnregisteredKind { api_version: String, kind: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("converting object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convert every object to its dynamic form.
///
/// Typed objects are stamped with the first kind the registry resolves for
/// their type. Stops at the first failure.
pub fn to_dynamic<I>(registry: &dyn Registry, objects: I) -> Result<Vec<DynamicObject>, ConversionError>
where
    I: IntoIterator<Item = Object>,
{
    objects
        .into_iter()
        .map(|obj| match obj {
            Object::Dynamic(d) => Ok(d),
            Object::Typed(t) => {
                let kinds = registry.object_kinds(t.resource())?;
                let gvk = kinds.first().ok_or(ConversionError::NoKinds { type_name: t.resource().type_name() })?;
                let mut d: DynamicObject = serde_json::from_value(t.to_json()?)?;
                d.types = Some(TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() });
                debug!(kind = %gvk.kind, name = ?d.metadata.name, "converted typed object");
                Ok(d)
            }
        })
        .collect()
}

/// Decode dynamic objects of registered kinds into their typed form.
pub fn to_typed<I>(registry: &dyn Registry, objects: I) -> Result<Vec<Object>, ConversionError>
where
    I: IntoIterator<Item = Object>,
{
    objects
        .into_iter()
        .map(|obj| match obj {
            Object::Typed(_) => Ok(obj),
            Object::Dynamic(d) => {
                let types = d.types.clone().unwrap_or_default();
                let known = obj_gvk(&types).and_then(|gvk| registry.is_namespaced(&gvk)).is_some();
                if !known {
                    return Err(ConversionError::UnregisteredKind { api_version: types.api_version, kind: types.kind });
                }
                let data = serde_json::to_vec(&d)?;
                Ok(registry.decode(&data, DecodeTarget::Registered)?)
            }
        })
        .collect()
}

fn obj_gvk(types: &TypeMeta) -> Option<kube::core::GroupVersionKind> {
    (!types.api_version.is_empty() && !types.kind.is_empty()).then(|| kubeguard_core::gvk_from_types(types))
}

/// Widen dynamic objects into the general object type.
pub fn to_client_objects<I>(objects: I) -> Vec<Object>
where
    I: IntoIterator<Item = DynamicObject>,
{
    objects.into_iter().map(Object::Dynamic).collect()
}
