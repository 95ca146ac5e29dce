//! In-memory delegate.
//!
//! Stores objects in dynamic form keyed by kind, namespace and name. Returned
//! objects are dynamic; writes hand back the stored object in the caller's
//! representation. The `status` sub-resource is the only one supported: main
//! resource updates keep the stored status, status writes touch nothing else.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kubeguard_core::{gvk_key, Object, Registry};
use serde_json::Value as Json;
use tracing::debug;

use crate::{
    into_dynamic, resolve_gvk, write_back, Client, ClientError, ClientResult, ListOptions, ObjectKey, ResourceMapping,
    SubResourceClient,
};

type StoreKey = (String, Option<String>, String);
type Store = BTreeMap<StoreKey, DynamicObject>;

/// Client backed by a process-local object store. Clones share the store.
#[derive(Clone)]
pub struct MemoryClient {
    registry: Arc<dyn Registry>,
    /// Kinds known besides the registry's, with their scope.
    extra_kinds: HashMap<GroupVersionKind, bool>,
    objects: Arc<RwLock<Store>>,
    revision: Arc<AtomicU64>,
}

impl MemoryClient {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            extra_kinds: HashMap::new(),
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            revision: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make a kind the registry does not know servable.
    pub fn with_kind(mut self, gvk: GroupVersionKind, namespaced: bool) -> Self {
        self.extra_kinds.insert(gvk, namespaced);
        self
    }

    /// Seed the store, failing on the first object that cannot be stored.
    pub fn with_objects<I>(self, objects: I) -> ClientResult<Self>
    where
        I: IntoIterator<Item = Object>,
    {
        for mut obj in objects {
            self.insert(&mut obj, false)?;
        }
        Ok(self)
    }

    /// Number of stored objects across all kinds.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Store> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Store> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mapping(&self, gvk: &GroupVersionKind) -> ClientResult<ResourceMapping> {
        let namespaced = self
            .extra_kinds
            .get(gvk)
            .copied()
            .or_else(|| self.registry.is_namespaced(gvk))
            .ok_or_else(|| ClientError::NoMapping(gvk_key(gvk)))?;
        Ok(ResourceMapping { resource: ApiResource::from_gvk(gvk), namespaced })
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Resolve kind, scope and key of an object about to be written.
    fn prepare(&self, obj: &Object) -> ClientResult<(GroupVersionKind, DynamicObject, StoreKey)> {
        let gvk = resolve_gvk(self.registry.as_ref(), obj)?;
        let mapping = self.mapping(&gvk)?;
        let mut d = into_dynamic(self.registry.as_ref(), obj)?;
        if mapping.namespaced {
            if d.metadata.namespace.as_deref().map_or(true, str::is_empty) {
                return Err(ClientError::NamespaceRequired(gvk_key(&gvk)));
            }
        } else {
            d.metadata.namespace = None;
        }
        let key = (gvk_key(&gvk), d.metadata.namespace.clone(), d.metadata.name.clone().unwrap_or_default());
        Ok((gvk, d, key))
    }

    fn insert(&self, obj: &mut Object, dry_run: bool) -> ClientResult<()> {
        let (gvk, mut d, _) = self.prepare(obj)?;
        if d.metadata.name.as_deref().map_or(true, str::is_empty) {
            let prefix = d.metadata.generate_name.clone().filter(|p| !p.is_empty()).ok_or(ClientError::MissingName)?;
            d.metadata.name = Some(format!("{prefix}{:05}", self.revision.load(Ordering::SeqCst) + 1));
        }
        let key = (gvk_key(&gvk), d.metadata.namespace.clone(), d.metadata.name.clone().unwrap_or_default());
        let mut store = self.write();
        if store.contains_key(&key) {
            return Err(ClientError::AlreadyExists { kind: gvk.kind, key: to_object_key(&key) });
        }
        let rev = self.next_revision();
        d.metadata.resource_version = Some(rev.clone());
        d.metadata.uid.get_or_insert_with(|| format!("00000000-0000-0000-0000-{:012}", rev.parse::<u64>().unwrap_or(0)));
        if !dry_run {
            store.insert(key, d.clone());
        }
        drop(store);
        debug!(kind = %gvk.kind, name = ?d.metadata.name, dry_run, "memory: created");
        write_back(self.registry.as_ref(), obj, d)
    }

    /// Replace a stored object through `merge`, which gets the stored object
    /// and the incoming one and returns the new content. With `check_version`
    /// a resourceVersion carried by `obj` must match the stored one.
    fn replace<F>(&self, obj: &mut Object, dry_run: bool, check_version: bool, merge: F) -> ClientResult<()>
    where
        F: FnOnce(&DynamicObject, DynamicObject) -> ClientResult<DynamicObject>,
    {
        let (gvk, incoming, key) = self.prepare(obj)?;
        if key.2.is_empty() {
            return Err(ClientError::MissingName);
        }
        let mut store = self.write();
        let current = store
            .get(&key)
            .ok_or_else(|| ClientError::NotFound { kind: gvk.kind.clone(), key: to_object_key(&key) })?;
        if let (true, Some(given), Some(stored)) =
            (check_version, incoming.metadata.resource_version.as_ref(), current.metadata.resource_version.as_ref())
        {
            if given != stored {
                return Err(ClientError::Conflict {
                    kind: gvk.kind,
                    key: to_object_key(&key),
                    given: given.clone(),
                    current: stored.clone(),
                });
            }
        }
        let mut next = merge(current, incoming)?;
        next.types = current.types.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.resource_version = Some(self.next_revision());
        if !dry_run {
            store.insert(key, next.clone());
        }
        drop(store);
        debug!(kind = %gvk.kind, name = ?next.metadata.name, dry_run, "memory: replaced");
        write_back(self.registry.as_ref(), obj, next)
    }

    fn select(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<(StoreKey, DynamicObject)>> {
        let selector = match &opts.label_selector {
            Some(s) => parse_selector(s)?,
            None => Vec::new(),
        };
        let kind = gvk_key(gvk);
        let store = self.read();
        Ok(store
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (opts.namespace.is_none() || *ns == opts.namespace))
            .filter(|(_, d)| selector.iter().all(|r| r.matches(d.metadata.labels.as_ref())))
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect())
    }
}

fn to_object_key((_, namespace, name): &StoreKey) -> ObjectKey {
    ObjectKey { namespace: namespace.clone(), name: name.clone() }
}

#[async_trait::async_trait]
impl Client for MemoryClient {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> ClientResult<Object> {
        let store_key = (gvk_key(gvk), key.namespace.clone(), key.name.clone());
        self.read()
            .get(&store_key)
            .cloned()
            .map(Object::Dynamic)
            .ok_or_else(|| ClientError::NotFound { kind: gvk.kind.clone(), key: key.clone() })
    }

    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>> {
        self.mapping(gvk)?;
        Ok(self.select(gvk, opts)?.into_iter().map(|(_, d)| Object::Dynamic(d)).collect())
    }

    async fn create(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()> {
        self.insert(obj, pp.dry_run)
    }

    async fn update(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()> {
        self.replace(obj, pp.dry_run, true, |current, mut incoming| {
            incoming.data = with_field(incoming.data, "status", current.data.get("status").cloned());
            Ok(incoming)
        })
    }

    async fn patch(&self, obj: &mut Object, patch: &Patch<Json>, pp: &PatchParams) -> ClientResult<()> {
        let body = merge_body(patch)?;
        self.replace(obj, pp.dry_run, false, |current, _| {
            let mut value = serde_json::to_value(current)?;
            merge_patch(&mut value, body);
            Ok(serde_json::from_value(value)?)
        })
    }

    async fn delete(&self, obj: &Object, dp: &DeleteParams) -> ClientResult<()> {
        let (gvk, _, key) = self.prepare(obj)?;
        let mut store = self.write();
        if !store.contains_key(&key) {
            return Err(ClientError::NotFound { kind: gvk.kind, key: to_object_key(&key) });
        }
        if !dp.dry_run {
            store.remove(&key);
        }
        debug!(kind = %gvk.kind, name = %key.2, "memory: deleted");
        Ok(())
    }

    async fn delete_all_of(&self, gvk: &GroupVersionKind, opts: &ListOptions, dp: &DeleteParams) -> ClientResult<()> {
        let mapping = self.mapping(gvk)?;
        if mapping.namespaced && opts.namespace.is_none() {
            return Err(ClientError::NamespaceRequired(gvk_key(gvk)));
        }
        let doomed = self.select(gvk, opts)?;
        debug!(kind = %gvk.kind, count = doomed.len(), "memory: delete collection");
        if !dp.dry_run {
            let mut store = self.write();
            for (key, _) in doomed {
                store.remove(&key);
            }
        }
        Ok(())
    }

    fn sub_resource(&self, name: &str) -> Box<dyn SubResourceClient> {
        Box::new(MemorySubResource { client: self.clone(), name: name.to_string() })
    }

    fn registry(&self) -> ClientResult<Arc<dyn Registry>> {
        Ok(self.registry.clone())
    }

    async fn resolve_mapping(&self, gvk: &GroupVersionKind) -> ClientResult<ResourceMapping> {
        self.mapping(gvk)
    }

    fn group_version_kind_for(&self, obj: &Object) -> ClientResult<GroupVersionKind> {
        resolve_gvk(self.registry.as_ref(), obj)
    }

    async fn is_object_namespaced(&self, obj: &Object) -> ClientResult<bool> {
        let gvk = resolve_gvk(self.registry.as_ref(), obj)?;
        Ok(self.mapping(&gvk)?.namespaced)
    }
}

/// Sub-resource handle of a [`MemoryClient`].
struct MemorySubResource {
    client: MemoryClient,
    name: String,
}

impl MemorySubResource {
    fn ensure_status(&self) -> ClientResult<()> {
        if self.name == "status" {
            Ok(())
        } else {
            Err(ClientError::Unsupported(format!("sub-resource {:?}", self.name)))
        }
    }
}

#[async_trait::async_trait]
impl SubResourceClient for MemorySubResource {
    async fn get(&self, obj: &Object) -> ClientResult<Object> {
        self.ensure_status()?;
        let gvk = resolve_gvk(self.client.registry.as_ref(), obj)?;
        self.client.get(&gvk, &ObjectKey::of(obj)?).await
    }

    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>> {
        self.ensure_status()?;
        self.client.list(gvk, opts).await
    }

    async fn create(&self, _obj: &Object, _sub: &mut Object, _pp: &PostParams) -> ClientResult<()> {
        Err(ClientError::Unsupported(format!("create on sub-resource {:?}", self.name)))
    }

    async fn update(&self, obj: &mut Object, pp: &PostParams) -> ClientResult<()> {
        self.ensure_status()?;
        self.client.replace(obj, pp.dry_run, true, |current, incoming| {
            let mut next = current.clone();
            next.data = with_field(next.data, "status", incoming.data.get("status").cloned());
            Ok(next)
        })
    }

    async fn patch(&self, obj: &mut Object, patch: &Patch<Json>, pp: &PatchParams) -> ClientResult<()> {
        self.ensure_status()?;
        let body = merge_body(patch)?;
        self.client.replace(obj, pp.dry_run, false, |current, _| {
            let mut patched = serde_json::to_value(current)?;
            merge_patch(&mut patched, body);
            let mut next = current.clone();
            next.data = with_field(next.data, "status", patched.get("status").cloned());
            Ok(next)
        })
    }
}

fn merge_body(patch: &Patch<Json>) -> ClientResult<&Json> {
    match patch {
        Patch::Merge(body) | Patch::Apply(body) => Ok(body),
        _ => Err(ClientError::Unsupported("only merge and apply patches are supported in memory".into())),
    }
}

/// Set or remove a top-level field of a dynamic object's content.
fn with_field(mut data: Json, field: &str, value: Option<Json>) -> Json {
    if let Some(map) = data.as_object_mut() {
        match value {
            Some(v) => {
                map.insert(field.to_string(), v);
            }
            None => {
                map.remove(field);
            }
        }
    }
    data
}

/// JSON merge patch (RFC 7386).
fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k));
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v),
            Requirement::NotEquals(k, v) => get(k) != Some(v),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::NotExists(k) => get(k).is_none(),
        }
    }
}

/// Parse an equality-based label selector (`a=b`, `a==b`, `a!=b`, `a`, `!a`).
fn parse_selector(sel: &str) -> ClientResult<Vec<Requirement>> {
    sel.split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else if term.contains(' ') || term.contains('(') {
                return Err(ClientError::Unsupported(format!("label selector term {term:?}")));
            } else {
                Requirement::Exists(term.to_string())
            };
            Ok(req)
        })
        .collect()
}
