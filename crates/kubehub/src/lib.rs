//! Keel kubehub: the object store port and its bindings.
//!
//! Every engine crate talks to the cluster through [`ObjectStore`] (generated,
//! weakly-typed objects) and [`ManagedApi`] (the typed managed resource). The
//! kube-rs binding lives in [`client`], an in-memory double in [`mem`].

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use keel_core::{ManagedObject, ReconcileKey, TypeKey};
use kube::core::DynamicObject;

pub mod client;
pub mod events;
#[cfg(any(test, feature = "testing"))]
pub mod mem;
pub mod registry;
pub mod selector;

pub use client::{KubeManagedApi, KubeStore};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
#[cfg(any(test, feature = "testing"))]
pub use events::{RecordedEvent, RecordingPublisher};
#[cfg(any(test, feature = "testing"))]
pub use mem::{Call, MemoryManagedApi, MemoryStore};
pub use registry::TypeRegistry;
pub use selector::LabelSelector;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("watch error: {0}")]
    Watch(String),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
    #[error("kubernetes error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_forbidden(&self) -> bool { matches!(self, StoreError::Forbidden(_)) }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) => match resp.code {
                404 => StoreError::NotFound(resp.message.clone()),
                409 => StoreError::Conflict(resp.message.clone()),
                403 => StoreError::Forbidden(resp.message.clone()),
                _ => StoreError::Kube(e),
            },
            _ => StoreError::Kube(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Foreground,
    Background,
    Orphan,
}

/// Change notification for a single object. Updates carry the previous state
/// so predicates can compare.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Created(DynamicObject),
    Updated { old: DynamicObject, new: DynamicObject },
    Deleted(DynamicObject),
}

impl WatchEvent {
    /// The object the event is about (the new state for updates).
    pub fn object(&self) -> &DynamicObject {
        match self {
            WatchEvent::Created(o) | WatchEvent::Deleted(o) => o,
            WatchEvent::Updated { new, .. } => new,
        }
    }
}

pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// A served type as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredType {
    pub key: TypeKey,
    pub plural: String,
    pub scope: Scope,
    pub verbs: Vec<String>,
}

/// Discovery result. Groups that failed to answer are listed, not fatal.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub types: Vec<DiscoveredType>,
    pub failed_groups: Vec<String>,
}

/// One resource rule from the controller's effective permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionRule {
    pub verbs: Vec<String>,
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
}

impl PermissionRule {
    pub fn allows(&self, verb: &str, group: &str, resource: &str) -> bool {
        let verb_ok = self.verbs.iter().any(|v| v == verb || v == "*");
        let group_ok = self.api_groups.iter().any(|g| g == group || g == "*");
        let res_ok = self.resources.iter().any(|r| r == resource || r == "*");
        verb_ok && group_ok && res_ok
    }
}

/// Port onto the declarative object store for generated objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn scope_of(&self, key: &TypeKey) -> StoreResult<Scope>;

    async fn get(&self, key: &TypeKey, namespace: Option<&str>, name: &str) -> StoreResult<Option<DynamicObject>>;

    /// `namespace = None` lists across all namespaces for namespaced types.
    async fn list(&self, key: &TypeKey, namespace: Option<&str>, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>>;

    /// Server-side apply; `force` claims contested fields for `field_owner`.
    async fn apply(&self, obj: &DynamicObject, field_owner: &str, force: bool) -> StoreResult<DynamicObject>;

    async fn delete(&self, key: &TypeKey, namespace: Option<&str>, name: &str, propagation: Propagation) -> StoreResult<()>;

    async fn watch(&self, key: &TypeKey) -> StoreResult<WatchStream>;

    /// Types that support `verb`.
    async fn discover(&self, verb: &str) -> StoreResult<Discovery>;

    async fn self_rules(&self, namespace: &str) -> StoreResult<Vec<PermissionRule>>;

    /// Forget cached type mappings (e.g. after new CRDs were applied).
    fn invalidate(&self);
}

/// Port onto the typed managed resource.
#[async_trait]
pub trait ManagedApi<K: ManagedObject>: Send + Sync {
    async fn get(&self, key: &ReconcileKey) -> StoreResult<Option<K>>;

    /// Full update guarded by the object's resource version.
    async fn update(&self, obj: &K) -> StoreResult<K>;

    /// Status subresource write guarded by the object's resource version.
    async fn update_status(&self, obj: &K) -> StoreResult<K>;
}

/// `kind:apiVersion:[ns:]name`, for logs.
pub fn object_ref(obj: &DynamicObject) -> String {
    let (kind, api_version) = obj
        .types
        .as_ref()
        .map(|t| (t.kind.as_str(), t.api_version.as_str()))
        .unwrap_or(("", ""));
    let name = obj.metadata.name.as_deref().unwrap_or("");
    match obj.metadata.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}:{}:{}:{}", kind, api_version, ns, name),
        _ => format!("{}:{}:{}", kind, api_version, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_rule_matches_wildcards() {
        let r = PermissionRule { verbs: vec!["*".into()], api_groups: vec!["apps".into()], resources: vec!["deployments".into()] };
        assert!(r.allows("delete", "apps", "deployments"));
        assert!(!r.allows("delete", "", "deployments"));

        let r = PermissionRule { verbs: vec!["get".into(), "delete".into()], api_groups: vec!["*".into()], resources: vec!["*".into()] };
        assert!(r.allows("delete", "rbac.authorization.k8s.io", "clusterroles"));
        assert!(!r.allows("patch", "", "secrets"));
    }

    #[test]
    fn object_ref_includes_namespace_when_present() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "Secret",
            "metadata": { "name": "tls", "namespace": "keel-system" }
        })).unwrap();
        assert_eq!(object_ref(&obj), "Secret:v1:keel-system:tls");
    }
}
