//! In-memory store double.
//!
//! Behaves like a small API server: resource versions move only when content
//! changes, generations move only when non-metadata content changes, watchers
//! receive created/updated/deleted notifications, and every call is recorded so
//! tests can assert on what the engine did. Failures can be injected per type.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use keel_core::{ManagedObject, ReconcileKey, TypeKey};
use kube::core::DynamicObject;
use serde_json::Value;

use crate::{
    DiscoveredType, Discovery, LabelSelector, ManagedApi, ObjectStore, PermissionRule, Propagation, Scope, StoreError,
    StoreResult, WatchEvent, WatchStream,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get { key: TypeKey, namespace: String, name: String },
    List { key: TypeKey, namespace: Option<String>, selector: String },
    Apply { key: TypeKey, namespace: String, name: String, force: bool },
    Delete { key: TypeKey, namespace: String, name: String },
    Watch(TypeKey),
    Discover(String),
    SelfRules(String),
}

#[derive(Debug, Clone)]
struct KindInfo {
    plural: String,
    scope: Scope,
    verbs: Vec<String>,
}

type ObjKey = (TypeKey, String, String);

#[derive(Default)]
struct Inner {
    kinds: HashMap<TypeKey, KindInfo>,
    objects: BTreeMap<ObjKey, DynamicObject>,
    rv: u64,
    calls: Vec<Call>,
    watchers: HashMap<TypeKey, Vec<mpsc::UnboundedSender<StoreResult<WatchEvent>>>>,
    rules: Vec<PermissionRule>,
    forbid_list: HashSet<TypeKey>,
    forbid_delete: HashSet<TypeKey>,
    failing_groups: HashSet<String>,
    invalidations: usize,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn kind(&self, key: &TypeKey) -> StoreResult<&KindInfo> {
        self.kinds.get(key).ok_or_else(|| StoreError::UnknownType(key.to_string()))
    }

    fn obj_key(&self, key: &TypeKey, namespace: Option<&str>, name: &str) -> StoreResult<ObjKey> {
        let ns = match self.kind(key)?.scope {
            Scope::Namespaced => namespace.unwrap_or("").to_string(),
            Scope::Cluster => String::new(),
        };
        Ok((key.clone(), ns, name.to_string()))
    }

    fn emit(&mut self, key: &TypeKey, ev: WatchEvent) {
        if let Some(subs) = self.watchers.get_mut(key) {
            subs.retain(|tx| tx.unbounded_send(Ok(ev.clone())).is_ok());
        }
    }

    fn remove(&mut self, k: &ObjKey) -> Option<DynamicObject> {
        let obj = self.objects.remove(k)?;
        self.emit(&k.0, WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }
}

const ALL_VERBS: &[&str] = &["create", "delete", "deletecollection", "get", "list", "patch", "update", "watch"];

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn without_volatile(obj: &DynamicObject) -> Value {
    let mut v = serde_json::to_value(obj).unwrap_or(Value::Null);
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for f in ["resourceVersion", "uid", "creationTimestamp", "generation", "managedFields"] {
            meta.remove(f);
        }
    }
    v
}

fn content(obj: &DynamicObject) -> Value {
    let mut v = without_volatile(obj);
    if let Some(m) = v.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    v
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// A store that knows the usual built-in kinds.
    pub fn with_defaults() -> Self {
        let s = Self::new();
        for (g, v, k, plural, scope) in [
            ("", "v1", "Secret", "secrets", Scope::Namespaced),
            ("", "v1", "ConfigMap", "configmaps", Scope::Namespaced),
            ("", "v1", "Service", "services", Scope::Namespaced),
            ("", "v1", "ServiceAccount", "serviceaccounts", Scope::Namespaced),
            ("apps", "v1", "Deployment", "deployments", Scope::Namespaced),
            ("apps", "v1", "StatefulSet", "statefulsets", Scope::Namespaced),
            ("rbac.authorization.k8s.io", "v1", "Role", "roles", Scope::Namespaced),
            ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", Scope::Namespaced),
            ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", Scope::Cluster),
            ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", Scope::Cluster),
            ("admissionregistration.k8s.io", "v1", "MutatingWebhookConfiguration", "mutatingwebhookconfigurations", Scope::Cluster),
            ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", Scope::Cluster),
            ("coordination.k8s.io", "v1", "Lease", "leases", Scope::Namespaced),
        ] {
            s.register_kind(TypeKey::new(g, v, k), plural, scope, ALL_VERBS);
        }
        s
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not wedge the others
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register_kind(&self, key: TypeKey, plural: &str, scope: Scope, verbs: &[&str]) {
        let info = KindInfo { plural: plural.to_string(), scope, verbs: verbs.iter().map(|v| v.to_string()).collect() };
        self.lock().kinds.insert(key, info);
    }

    /// Seed an object as if created by someone else. Assigns uid and resource version.
    pub fn insert(&self, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = TypeKey::of(&obj).ok_or_else(|| StoreError::Invalid("missing apiVersion/kind".into()))?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut g = self.lock();
        let k = g.obj_key(&key, obj.metadata.namespace.as_deref(), &name)?;
        if k.1.is_empty() { obj.metadata.namespace = None; }
        if obj.metadata.uid.is_none() { obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string()); }
        obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(1));
        obj.metadata.resource_version = Some(g.next_rv());
        let ev = match g.objects.insert(k, obj.clone()) {
            Some(old) => WatchEvent::Updated { old, new: obj.clone() },
            None => WatchEvent::Created(obj.clone()),
        };
        g.emit(&key, ev);
        Ok(obj)
    }

    /// Replace the `status` of a stored object (a workload controller reporting progress).
    pub fn set_status(&self, key: &TypeKey, namespace: Option<&str>, name: &str, status: Value) -> StoreResult<()> {
        let mut g = self.lock();
        let k = g.obj_key(key, namespace, name)?;
        let rv = g.next_rv();
        let (old, new) = {
            let obj = g.objects.get_mut(&k).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            let old = obj.clone();
            obj.data["status"] = status;
            obj.metadata.resource_version = Some(rv);
            (old, obj.clone())
        };
        g.emit(key, WatchEvent::Updated { old, new });
        Ok(())
    }

    /// End every open watch stream of one type, as a dropped API server connection would.
    pub fn close_watches(&self, key: &TypeKey) { self.lock().watchers.remove(key); }

    pub fn object(&self, key: &TypeKey, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let g = self.lock();
        let k = g.obj_key(key, namespace, name).ok()?;
        g.objects.get(&k).cloned()
    }

    pub fn objects(&self) -> Vec<DynamicObject> { self.lock().objects.values().cloned().collect() }

    /// Names of stored objects of one type, sorted.
    pub fn names(&self, key: &TypeKey) -> Vec<String> {
        self.lock().objects.keys().filter(|(t, _, _)| t == key).map(|(_, _, n)| n.clone()).collect()
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize { self.lock().calls.iter().filter(|c| pred(c)).count() }

    pub fn invalidations(&self) -> usize { self.lock().invalidations }

    pub fn set_rules(&self, rules: Vec<PermissionRule>) { self.lock().rules = rules; }

    /// Grant every verb on everything.
    pub fn allow_all(&self) {
        self.set_rules(vec![PermissionRule { verbs: vec!["*".into()], api_groups: vec!["*".into()], resources: vec!["*".into()] }]);
    }

    pub fn forbid_list(&self, key: TypeKey) { self.lock().forbid_list.insert(key); }

    pub fn forbid_delete(&self, key: TypeKey) { self.lock().forbid_delete.insert(key); }

    pub fn fail_discovery_group(&self, group: &str) { self.lock().failing_groups.insert(group.to_string()); }

    /// Remove every object owned by `uid` (what the cluster garbage collector does).
    pub fn collect_owned(&self, uid: &str) -> usize {
        let mut g = self.lock();
        let owned: Vec<ObjKey> = g
            .objects
            .iter()
            .filter(|(_, o)| o.metadata.owner_references.as_deref().unwrap_or(&[]).iter().any(|r| r.uid == uid))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &owned {
            g.remove(k);
        }
        owned.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn scope_of(&self, key: &TypeKey) -> StoreResult<Scope> { Ok(self.lock().kind(key)?.scope) }

    async fn get(&self, key: &TypeKey, namespace: Option<&str>, name: &str) -> StoreResult<Option<DynamicObject>> {
        let mut g = self.lock();
        let k = g.obj_key(key, namespace, name)?;
        g.calls.push(Call::Get { key: key.clone(), namespace: k.1.clone(), name: name.to_string() });
        Ok(g.objects.get(&k).cloned())
    }

    async fn list(&self, key: &TypeKey, namespace: Option<&str>, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>> {
        let mut g = self.lock();
        g.calls.push(Call::List { key: key.clone(), namespace: namespace.map(str::to_string), selector: selector.to_string() });
        let scope = g.kind(key)?.scope;
        if g.forbid_list.contains(key) {
            return Err(StoreError::Forbidden(format!("list {}", key)));
        }
        let empty = BTreeMap::new();
        Ok(g
            .objects
            .iter()
            .filter(|((t, ns, _), _)| t == key && (scope == Scope::Cluster || namespace.map_or(true, |n| n == ns.as_str())))
            .filter(|(_, o)| selector.matches(o.metadata.labels.as_ref().unwrap_or(&empty)))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn apply(&self, obj: &DynamicObject, _field_owner: &str, force: bool) -> StoreResult<DynamicObject> {
        let key = TypeKey::of(obj).ok_or_else(|| StoreError::Invalid("missing apiVersion/kind".into()))?;
        let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Invalid(format!("{} without metadata.name", key)))?;
        let mut g = self.lock();
        let k = g.obj_key(&key, obj.metadata.namespace.as_deref(), &name)?;
        g.calls.push(Call::Apply { key: key.clone(), namespace: k.1.clone(), name: name.clone(), force });

        let mut next = obj.clone();
        if k.1.is_empty() { next.metadata.namespace = None; }
        match g.objects.get(&k).cloned() {
            Some(cur) => {
                // manifests never carry status; keep what the workload controller wrote
                if next.data.get("status").is_none() {
                    if let Some(st) = cur.data.get("status") { next.data["status"] = st.clone(); }
                }
                if without_volatile(&cur) == without_volatile(&next) {
                    return Ok(cur);
                }
                next.metadata.uid = cur.metadata.uid.clone();
                next.metadata.creation_timestamp = cur.metadata.creation_timestamp.clone();
                let gen = cur.metadata.generation.unwrap_or(1);
                next.metadata.generation = Some(if content(&cur) == content(&next) { gen } else { gen + 1 });
                next.metadata.resource_version = Some(g.next_rv());
                g.objects.insert(k, next.clone());
                g.emit(&key, WatchEvent::Updated { old: cur, new: next.clone() });
            }
            None => {
                next.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                next.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
                next.metadata.generation = Some(1);
                next.metadata.resource_version = Some(g.next_rv());
                g.objects.insert(k, next.clone());
                g.emit(&key, WatchEvent::Created(next.clone()));
            }
        }
        Ok(next)
    }

    async fn delete(&self, key: &TypeKey, namespace: Option<&str>, name: &str, _propagation: Propagation) -> StoreResult<()> {
        let mut g = self.lock();
        let k = g.obj_key(key, namespace, name)?;
        g.calls.push(Call::Delete { key: key.clone(), namespace: k.1.clone(), name: name.to_string() });
        if g.forbid_delete.contains(key) {
            return Err(StoreError::Forbidden(format!("delete {} {}", key, name)));
        }
        let removed = g.remove(&k).ok_or_else(|| StoreError::NotFound(format!("{} {}", key, name)))?;
        if let Some(uid) = removed.metadata.uid {
            drop(g);
            self.collect_owned(&uid);
        }
        Ok(())
    }

    async fn watch(&self, key: &TypeKey) -> StoreResult<WatchStream> {
        let mut g = self.lock();
        g.calls.push(Call::Watch(key.clone()));
        g.kind(key)?;
        let (tx, rx) = mpsc::unbounded();
        for ((t, _, _), o) in g.objects.iter() {
            if t == key {
                let _ = tx.unbounded_send(Ok(WatchEvent::Created(o.clone())));
            }
        }
        g.watchers.entry(key.clone()).or_default().push(tx);
        Ok(rx.boxed())
    }

    async fn discover(&self, verb: &str) -> StoreResult<Discovery> {
        let mut g = self.lock();
        g.calls.push(Call::Discover(verb.to_string()));
        let mut out = Discovery::default();
        for (key, info) in g.kinds.iter() {
            if g.failing_groups.contains(&key.group) {
                let gv = key.api_version();
                if !out.failed_groups.contains(&gv) { out.failed_groups.push(gv); }
                continue;
            }
            if !info.verbs.iter().any(|v| v == verb) { continue; }
            out.types.push(DiscoveredType { key: key.clone(), plural: info.plural.clone(), scope: info.scope, verbs: info.verbs.clone() });
        }
        out.types.sort_by(|a, b| a.key.cmp(&b.key));
        out.failed_groups.sort();
        Ok(out)
    }

    async fn self_rules(&self, namespace: &str) -> StoreResult<Vec<PermissionRule>> {
        let mut g = self.lock();
        g.calls.push(Call::SelfRules(namespace.to_string()));
        Ok(g.rules.clone())
    }

    fn invalidate(&self) { self.lock().invalidations += 1; }
}

struct ManagedInner<K> {
    objects: BTreeMap<ReconcileKey, K>,
    rv: u64,
    status_conflicts: usize,
    status_writes: usize,
    updates: usize,
}

/// In-memory typed API for the managed resource. Writes are checked against the
/// stored resource version; final removal cascades to owned objects in `store`.
pub struct MemoryManagedApi<K> {
    inner: Mutex<ManagedInner<K>>,
    store: Option<Arc<MemoryStore>>,
    _k: PhantomData<fn() -> K>,
}

impl<K: ManagedObject> MemoryManagedApi<K> {
    pub fn new(store: Option<Arc<MemoryStore>>) -> Self {
        let inner = ManagedInner { objects: BTreeMap::new(), rv: 0, status_conflicts: 0, status_writes: 0, updates: 0 };
        Self { inner: Mutex::new(inner), store, _k: PhantomData }
    }

    fn lock(&self) -> MutexGuard<'_, ManagedInner<K>> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn insert(&self, mut obj: K) -> K {
        let mut g = self.lock();
        g.rv += 1;
        let meta = obj.meta_mut();
        if meta.uid.is_none() { meta.uid = Some(uuid::Uuid::new_v4().to_string()); }
        meta.generation = Some(meta.generation.unwrap_or(1));
        meta.resource_version = Some(g.rv.to_string());
        g.objects.insert(obj.key(), obj.clone());
        obj
    }

    pub fn stored(&self, key: &ReconcileKey) -> Option<K> { self.lock().objects.get(key).cloned() }

    /// A user edit: applies `f`, bumps generation and resource version.
    pub fn edit(&self, key: &ReconcileKey, f: impl FnOnce(&mut K)) -> Option<K> {
        let mut g = self.lock();
        g.rv += 1;
        let rv = g.rv.to_string();
        let obj = g.objects.get_mut(key)?;
        f(obj);
        let meta = obj.meta_mut();
        meta.generation = Some(meta.generation.unwrap_or(1) + 1);
        meta.resource_version = Some(rv);
        Some(obj.clone())
    }

    /// Request deletion. Without finalizers the object is removed at once.
    pub fn mark_deleting(&self, key: &ReconcileKey) {
        let mut g = self.lock();
        g.rv += 1;
        let rv = g.rv.to_string();
        let Some(obj) = g.objects.get_mut(key) else { return };
        let meta = obj.meta_mut();
        meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
        meta.resource_version = Some(rv);
        let done = meta.finalizers.as_deref().unwrap_or(&[]).is_empty();
        drop(g);
        if done { self.finalize(key); }
    }

    /// Make the next `n` status writes fail with a conflict.
    pub fn conflict_next_status_writes(&self, n: usize) { self.lock().status_conflicts = n; }

    pub fn status_writes(&self) -> usize { self.lock().status_writes }

    pub fn updates(&self) -> usize { self.lock().updates }

    fn finalize(&self, key: &ReconcileKey) {
        let removed = self.lock().objects.remove(key);
        if let (Some(obj), Some(store)) = (removed, self.store.as_ref()) {
            if let Some(uid) = obj.meta().uid.as_deref() {
                store.collect_owned(uid);
            }
        }
    }

    fn check_rv(g: &ManagedInner<K>, obj: &K) -> StoreResult<K> {
        let key = obj.key();
        let cur = g.objects.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if cur.meta().resource_version != obj.meta().resource_version {
            return Err(StoreError::Conflict(format!("{} has been modified", key)));
        }
        Ok(cur.clone())
    }
}

#[async_trait]
impl<K: ManagedObject> ManagedApi<K> for MemoryManagedApi<K> {
    async fn get(&self, key: &ReconcileKey) -> StoreResult<Option<K>> { Ok(self.stored(key)) }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = obj.key();
        let next = {
            let mut g = self.lock();
            let cur = Self::check_rv(&g, obj)?;
            g.rv += 1;
            g.updates += 1;
            let mut next = obj.clone();
            // full updates do not touch status
            match cur.status() {
                Some(st) => *next.status_mut() = st.clone(),
                None => *next.status_mut() = Default::default(),
            }
            next.meta_mut().resource_version = Some(g.rv.to_string());
            g.objects.insert(key.clone(), next.clone());
            next
        };
        if next.is_deleting() && next.meta().finalizers.as_deref().unwrap_or(&[]).is_empty() {
            self.finalize(&key);
        }
        Ok(next)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let mut g = self.lock();
        if g.status_conflicts > 0 {
            g.status_conflicts -= 1;
            return Err(StoreError::Conflict(format!("{} status has been modified", obj.key())));
        }
        let mut next = Self::check_rv(&g, obj)?;
        g.rv += 1;
        g.status_writes += 1;
        *next.status_mut() = obj.status().cloned().unwrap_or_default();
        next.meta_mut().resource_version = Some(g.rv.to_string());
        g.objects.insert(obj.key(), next.clone());
        Ok(next)
    }
}
