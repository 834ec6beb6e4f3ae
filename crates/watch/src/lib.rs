//! Keel watch: the subscription manager.
//!
//! Watches are registered lazily, once per type, while the apply path walks
//! the rendered objects. Each watch runs a small pump task that filters events
//! through a change predicate and routes survivors to a reconcile key.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use keel_core::{kinds, labels, ReconcileKey, TypeKey};
use keel_kubehub::{ObjectStore, WatchEvent, WatchStream};
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub mod predicate;

pub use predicate::{dependent_changed, generation_changed, generation_or_status_changed, has_release_labels, DiffSummary, WatchPolicy};

/// How an event object is mapped back to the managed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Namespaced dependents: follow the controller owner reference of this kind.
    Owner { api_version: String, kind: String },
    /// Cluster-scoped dependents: read the release name/namespace labels.
    Labels,
    /// The managed type itself.
    Own,
    /// A managed resource created by another controller: follow the controller
    /// owner reference of this kind, triggering on spec or status changes.
    Delegated { api_version: String, kind: String },
}

/// Watch policy for a dependent type.
pub fn policy_for(key: &TypeKey) -> WatchPolicy {
    WatchPolicy {
        watch_update: !kinds::is_install_only(key),
        watch_delete: true,
        watch_status: kinds::is_status_bearing(key),
    }
}

/// Map an event object to the reconcile key it belongs to, if any.
pub fn route(obj: &DynamicObject, routing: &Routing) -> Option<ReconcileKey> {
    match routing {
        Routing::Owner { api_version, kind } | Routing::Delegated { api_version, kind } => {
            let ns = obj.metadata.namespace.as_deref()?;
            obj.metadata
                .owner_references
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .find(|r| r.controller == Some(true) && &r.kind == kind && &r.api_version == api_version)
                .map(|r| ReconcileKey::new(ns, r.name.clone()))
        }
        Routing::Labels => {
            let l = obj.metadata.labels.as_ref()?;
            let name = l.get(labels::RELEASE_NAME).filter(|s| !s.is_empty())?;
            let ns = l.get(labels::RELEASE_NAMESPACE).filter(|s| !s.is_empty())?;
            Some(ReconcileKey::new(ns.clone(), name.clone()))
        }
        Routing::Own => Some(ReconcileKey::new(obj.metadata.namespace.clone()?, obj.metadata.name.clone()?)),
    }
}

/// Full filter+route step for one event.
pub fn trigger_for(key: &TypeKey, ev: &WatchEvent, routing: &Routing) -> Option<ReconcileKey> {
    let pass = match routing {
        Routing::Own => generation_changed(ev),
        Routing::Delegated { .. } => generation_or_status_changed(ev),
        Routing::Owner { .. } | Routing::Labels => has_release_labels(ev.object()) && dependent_changed(ev, &policy_for(key)),
    };
    if !pass { return None; }
    route(ev.object(), routing)
}

/// Set of watched types feeding one reconcile queue. A type leaves the set
/// only when its watch stream ends, so the next `ensure_watch` recreates it.
pub struct SubscriptionManager {
    store: Arc<dyn ObjectStore>,
    tx: mpsc::UnboundedSender<ReconcileKey>,
    registered: Arc<Mutex<FxHashSet<TypeKey>>>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn ObjectStore>, tx: mpsc::UnboundedSender<ReconcileKey>) -> Self {
        Self { store, tx, registered: Arc::new(Mutex::new(FxHashSet::default())) }
    }

    /// Register a watch for `key` unless one exists. The type is claimed before
    /// the store is asked, so concurrent callers for the same type see exactly
    /// one watch and callers for other types are not held up.
    pub async fn ensure_watch(&self, key: &TypeKey, routing: Routing) -> Result<()> {
        if !self.registered.lock().await.insert(key.clone()) {
            return Ok(());
        }
        let stream = match self.store.watch(key).await.with_context(|| format!("watching {}", key)) {
            Ok(s) => s,
            Err(e) => {
                self.registered.lock().await.remove(key);
                return Err(e);
            }
        };
        info!(kind = %key, ?routing, "watch");
        counter!("watch_registered_total", 1u64);
        tokio::spawn(pump(key.clone(), stream, routing, self.tx.clone(), self.registered.clone()));
        Ok(())
    }

    pub async fn is_watching(&self, key: &TypeKey) -> bool { self.registered.lock().await.contains(key) }

    pub async fn watched(&self) -> Vec<TypeKey> {
        let mut v: Vec<TypeKey> = self.registered.lock().await.iter().cloned().collect();
        v.sort();
        v
    }
}

async fn pump(
    key: TypeKey,
    mut stream: WatchStream,
    routing: Routing,
    tx: mpsc::UnboundedSender<ReconcileKey>,
    registered: Arc<Mutex<FxHashSet<TypeKey>>>,
) {
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(ev) => {
                let Some(rk) = trigger_for(&key, &ev, &routing) else { continue };
                debug!(kind = %key, key = %rk, "trigger");
                counter!("watch_triggers_total", 1u64);
                if tx.send(rk).is_err() {
                    debug!(kind = %key, "queue closed; watch stopped");
                    break;
                }
            }
            Err(e) => warn!(kind = %key, error = %e, "watch error"),
        }
    }
    warn!(kind = %key, "watch stream ended");
    registered.lock().await.remove(&key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> DynamicObject { serde_json::from_value(v).unwrap() }

    #[test]
    fn owner_routing_uses_controller_reference_only() {
        let o = obj(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "api", "namespace": "keel-system", "ownerReferences": [
                { "apiVersion": "operator.keel.dev/v1alpha1", "kind": "RuntimeInstance", "name": "other", "uid": "u1" },
                { "apiVersion": "operator.keel.dev/v1alpha1", "kind": "RuntimeInstance", "name": "runtime-instance", "uid": "u2", "controller": true }
            ]}
        }));
        let r = Routing::Owner { api_version: "operator.keel.dev/v1alpha1".into(), kind: "RuntimeInstance".into() };
        assert_eq!(route(&o, &r), Some(ReconcileKey::new("keel-system", "runtime-instance")));
        let r = Routing::Owner { api_version: "apps/v1".into(), kind: "Deployment".into() };
        assert_eq!(route(&o, &r), None);
    }

    #[test]
    fn label_routing_needs_both_labels() {
        let o = obj(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole",
            "metadata": { "name": "x", "labels": { (labels::RELEASE_NAME): "runtime-instance", (labels::RELEASE_NAMESPACE): "keel-system" } }
        }));
        assert_eq!(route(&o, &Routing::Labels), Some(ReconcileKey::new("keel-system", "runtime-instance")));
        let o = obj(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole",
            "metadata": { "name": "x", "labels": { (labels::RELEASE_NAME): "runtime-instance" } }
        }));
        assert_eq!(route(&o, &Routing::Labels), None);
    }

    #[test]
    fn policy_for_special_kinds() {
        let p = policy_for(&TypeKey::new("", "v1", "Secret"));
        assert!(!p.watch_update && p.watch_delete && !p.watch_status);
        let p = policy_for(&TypeKey::new("apps", "v1", "Deployment"));
        assert!(p.watch_update && p.watch_status);
        let p = policy_for(&TypeKey::new("", "v1", "ConfigMap"));
        assert_eq!(p, WatchPolicy::default());
    }
}
