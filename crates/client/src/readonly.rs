//! Read-only decorator over a [`Client`].
//!
//! Reads and introspection are forwarded to the delegate. Writes never reach
//! it: the [`WritePolicy`] answers them instead. Sub-resource handles are
//! wrapped with the same policy, so no chain of `status()`/`sub_resource()`
//! calls on a [`ReadOnlyClient`] can mutate anything.
//!
//! A decorator may be built without a delegate ([`ReadOnlyClient::detached`]).
//! It still answers every write through its policy, while reads fail with
//! [`ClientError::NoDelegate`].

use std::fmt;
use std::sync::Arc;

use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kubeguard_core::{Object, Registry};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

use crate::{Client, ClientError, ClientResult, ListOptions, ObjectKey, Operation, ResourceMapping, SubResourceClient};

type PolicyFn = dyn Fn(Operation) -> ClientResult<()> + Send + Sync;

/// Answer to a write on a read-only client.
#[derive(Clone)]
pub struct WritePolicy(Arc<PolicyFn>);

impl WritePolicy {
    /// Fail with `"<Operation> not allowed in read-only mode"`.
    pub fn deny() -> Self {
        Self::from_fn(|op| Err(ClientError::WriteDenied(op)))
    }

    /// Report success without doing anything.
    pub fn allow_silently() -> Self {
        Self::from_fn(|_| Ok(()))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Operation) -> ClientResult<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn check(&self, op: Operation) -> ClientResult<()> {
        (self.0)(op)
    }

    /// True when both handles share one policy instance.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn intercept(&self, op: Operation) -> ClientResult<()> {
        counter!("readonly_writes_intercepted", 1u64, "op" => op.as_str());
        let res = self.check(op);
        debug!(op = %op, denied = res.is_err(), "read-only: write intercepted");
        res
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::deny()
    }
}

impl fmt::Debug for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WritePolicy(..)")
    }
}

/// Client that forwards reads and answers writes with its [`WritePolicy`].
#[derive(Clone)]
pub struct ReadOnlyClient {
    delegate: Option<Arc<dyn Client>>,
    policy: WritePolicy,
}

impl ReadOnlyClient {
    pub fn new(delegate: Arc<dyn Client>) -> Self {
        Self { delegate: Some(delegate), policy: WritePolicy::default() }
    }

    /// Decorator without a delegate: writes are answered, reads fail.
    pub fn detached() -> Self {
        Self { delegate: None, policy: WritePolicy::default() }
    }

    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    fn delegate(&self) -> ClientResult<&dyn Client> {
        self.delegate.as_deref().ok_or(ClientError::NoDelegate)
    }
}

impl fmt::Debug for ReadOnlyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyClient").field("delegate", &self.delegate.is_some()).field("policy", &self.policy).finish()
    }
}

#[async_trait::async_trait]
impl Client for ReadOnlyClient {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> ClientResult<Object> {
        self.delegate()?.get(gvk, key).await
    }

    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>> {
        self.delegate()?.list(gvk, opts).await
    }

    async fn create(&self, _obj: &mut Object, _pp: &PostParams) -> ClientResult<()> {
        self.policy.intercept(Operation::Create)
    }

    async fn update(&self, _obj: &mut Object, _pp: &PostParams) -> ClientResult<()> {
        self.policy.intercept(Operation::Update)
    }

    async fn patch(&self, _obj: &mut Object, _patch: &Patch<Json>, _pp: &PatchParams) -> ClientResult<()> {
        self.policy.intercept(Operation::Patch)
    }

    async fn delete(&self, _obj: &Object, _dp: &DeleteParams) -> ClientResult<()> {
        self.policy.intercept(Operation::Delete)
    }

    async fn delete_all_of(&self, _gvk: &GroupVersionKind, _opts: &ListOptions, _dp: &DeleteParams) -> ClientResult<()> {
        self.policy.intercept(Operation::DeleteAllOf)
    }

    fn sub_resource(&self, name: &str) -> Box<dyn SubResourceClient> {
        let inner = self.delegate.as_ref().map(|d| d.sub_resource(name));
        Box::new(ReadOnlySubResourceClient::new(inner, self.policy.clone()))
    }

    fn registry(&self) -> ClientResult<Arc<dyn Registry>> {
        self.delegate()?.registry()
    }

    async fn resolve_mapping(&self, gvk: &GroupVersionKind) -> ClientResult<ResourceMapping> {
        self.delegate()?.resolve_mapping(gvk).await
    }

    fn group_version_kind_for(&self, obj: &Object) -> ClientResult<GroupVersionKind> {
        self.delegate()?.group_version_kind_for(obj)
    }

    async fn is_object_namespaced(&self, obj: &Object) -> ClientResult<bool> {
        self.delegate()?.is_object_namespaced(obj).await
    }
}

/// Sub-resource handle of a [`ReadOnlyClient`].
pub struct ReadOnlySubResourceClient {
    delegate: Option<Box<dyn SubResourceClient>>,
    policy: WritePolicy,
}

impl ReadOnlySubResourceClient {
    pub fn new(delegate: Option<Box<dyn SubResourceClient>>, policy: WritePolicy) -> Self {
        Self { delegate, policy }
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    fn delegate(&self) -> ClientResult<&dyn SubResourceClient> {
        self.delegate.as_deref().ok_or(ClientError::NoDelegate)
    }
}

#[async_trait::async_trait]
impl SubResourceClient for ReadOnlySubResourceClient {
    async fn get(&self, obj: &Object) -> ClientResult<Object> {
        self.delegate()?.get(obj).await
    }

    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> ClientResult<Vec<Object>> {
        self.delegate()?.list(gvk, opts).await
    }

    async fn create(&self, _obj: &Object, _sub: &mut Object, _pp: &PostParams) -> ClientResult<()> {
        self.policy.intercept(Operation::Create)
    }

    async fn update(&self, _obj: &mut Object, _pp: &PostParams) -> ClientResult<()> {
        self.policy.intercept(Operation::Update)
    }

    async fn patch(&self, _obj: &mut Object, _patch: &Patch<Json>, _pp: &PatchParams) -> ClientResult<()> {
        self.policy.intercept(Operation::Patch)
    }
}
