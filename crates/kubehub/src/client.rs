//! kube-rs binding of the store ports.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::api::authorization::v1::{SelfSubjectRulesReview, SelfSubjectRulesReviewSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use keel_core::{ManagedObject, ReconcileKey, TypeKey};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
    core::DynamicObject,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    DiscoveredType, Discovery, LabelSelector, ObjectStore, PermissionRule, Propagation, Scope, StoreError, StoreResult,
    TypeRegistry, WatchEvent, WatchStream,
};

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<TypeRegistry>,
}

impl KubeStore {
    pub fn new(client: Client, registry: Arc<TypeRegistry>) -> Self { Self { client, registry } }

    pub fn client(&self) -> &Client { &self.client }

    async fn api_for(&self, key: &TypeKey, namespace: Option<&str>) -> StoreResult<(Api<DynamicObject>, Scope)> {
        let (ar, scope) = self.registry.resolve(&self.client, key).await?;
        let api = match (scope, namespace) {
            (Scope::Namespaced, Some(ns)) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, scope))
    }
}

fn propagation_policy(p: Propagation) -> PropagationPolicy {
    match p {
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Orphan => PropagationPolicy::Orphan,
    }
}

fn cache_key(obj: &DynamicObject) -> String {
    format!("{}/{}", obj.metadata.namespace.as_deref().unwrap_or(""), obj.metadata.name.as_deref().unwrap_or(""))
}

/// Turn raw watcher events into created/updated/deleted notifications using a
/// per-stream cache of last seen objects. A restart diffs the fresh listing
/// against the cache so objects that vanished during the gap still surface as
/// deletions.
pub fn translate(cache: &mut HashMap<String, DynamicObject>, ev: watcher::Event<DynamicObject>) -> Vec<WatchEvent> {
    match ev {
        watcher::Event::Applied(obj) => match cache.insert(cache_key(&obj), obj.clone()) {
            Some(old) => vec![WatchEvent::Updated { old, new: obj }],
            None => vec![WatchEvent::Created(obj)],
        },
        watcher::Event::Deleted(obj) => {
            cache.remove(&cache_key(&obj));
            vec![WatchEvent::Deleted(obj)]
        }
        watcher::Event::Restarted(list) => {
            let mut out = Vec::new();
            let mut seen = HashSet::new();
            for obj in list {
                let k = cache_key(&obj);
                seen.insert(k.clone());
                match cache.insert(k, obj.clone()) {
                    Some(old) if old.metadata.resource_version == obj.metadata.resource_version => {}
                    Some(old) => out.push(WatchEvent::Updated { old, new: obj }),
                    None => out.push(WatchEvent::Created(obj)),
                }
            }
            let gone: Vec<String> = cache.keys().filter(|k| !seen.contains(*k)).cloned().collect();
            for k in gone {
                if let Some(obj) = cache.remove(&k) {
                    out.push(WatchEvent::Deleted(obj));
                }
            }
            out
        }
    }
}

fn push_resources(out: &mut Vec<DiscoveredType>, list: &APIResourceList, verb: &str) {
    let (group, version) = match list.group_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), list.group_version.clone()),
    };
    for r in &list.resources {
        // subresources such as deployments/status
        if r.name.contains('/') { continue; }
        if !r.verbs.iter().any(|v| v == verb) { continue; }
        out.push(DiscoveredType {
            key: TypeKey::new(group.clone(), version.clone(), r.kind.clone()),
            plural: r.name.clone(),
            scope: if r.namespaced { Scope::Namespaced } else { Scope::Cluster },
            verbs: r.verbs.clone(),
        });
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn scope_of(&self, key: &TypeKey) -> StoreResult<Scope> {
        Ok(self.registry.resolve(&self.client, key).await?.1)
    }

    async fn get(&self, key: &TypeKey, namespace: Option<&str>, name: &str) -> StoreResult<Option<DynamicObject>> {
        let (api, _) = self.api_for(key, namespace).await?;
        Ok(api.get_opt(name).await?)
    }

    async fn list(&self, key: &TypeKey, namespace: Option<&str>, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>> {
        let (api, _) = self.api_for(key, namespace).await?;
        let sel = selector.to_string();
        let mut lp = ListParams::default();
        if !sel.is_empty() { lp = lp.labels(&sel); }
        Ok(api.list(&lp).await?.items)
    }

    async fn apply(&self, obj: &DynamicObject, field_owner: &str, force: bool) -> StoreResult<DynamicObject> {
        let key = TypeKey::of(obj).ok_or_else(|| StoreError::Invalid("missing apiVersion/kind".into()))?;
        let name = obj.metadata.name.as_deref().ok_or_else(|| StoreError::Invalid(format!("{} without metadata.name", key)))?;
        let (api, _) = self.api_for(&key, obj.metadata.namespace.as_deref()).await?;
        let mut pp = PatchParams::apply(field_owner);
        if force { pp = pp.force(); }
        let out = api.patch(name, &pp, &Patch::Apply(obj)).await?;
        debug!(kind = %key, name, "applied");
        Ok(out)
    }

    async fn delete(&self, key: &TypeKey, namespace: Option<&str>, name: &str, propagation: Propagation) -> StoreResult<()> {
        let (api, _) = self.api_for(key, namespace).await?;
        let dp = DeleteParams { propagation_policy: Some(propagation_policy(propagation)), ..DeleteParams::default() };
        api.delete(name, &dp).await?;
        Ok(())
    }

    async fn watch(&self, key: &TypeKey) -> StoreResult<WatchStream> {
        let (api, scope) = self.api_for(key, None).await?;
        info!(kind = %key, ?scope, "watcher started");
        let mut cache: HashMap<String, DynamicObject> = HashMap::new();
        let s = watcher(api, watcher::Config::default())
            .default_backoff()
            .map(move |ev| match ev {
                Ok(ev) => translate(&mut cache, ev).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(StoreError::Watch(e.to_string()))],
            })
            .flat_map(stream::iter);
        Ok(s.boxed())
    }

    async fn discover(&self, verb: &str) -> StoreResult<Discovery> {
        let mut out = Discovery::default();
        let core = self.client.list_core_api_versions().await?;
        for v in &core.versions {
            match self.client.list_core_api_resources(v).await {
                Ok(list) => push_resources(&mut out.types, &list, verb),
                Err(e) => {
                    warn!(group_version = %v, error = %e, "discovery failed");
                    out.failed_groups.push(v.clone());
                }
            }
        }
        let groups = self.client.list_api_groups().await?;
        for g in &groups.groups {
            let Some(gv) = g.preferred_version.as_ref().or_else(|| g.versions.first()) else { continue };
            match self.client.list_api_group_resources(&gv.group_version).await {
                Ok(list) => push_resources(&mut out.types, &list, verb),
                Err(e) => {
                    warn!(group_version = %gv.group_version, error = %e, "discovery failed");
                    out.failed_groups.push(gv.group_version.clone());
                }
            }
        }
        out.types.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn self_rules(&self, namespace: &str) -> StoreResult<Vec<PermissionRule>> {
        let review = SelfSubjectRulesReview {
            spec: SelfSubjectRulesReviewSpec { namespace: Some(namespace.to_string()) },
            ..Default::default()
        };
        let api: Api<SelfSubjectRulesReview> = Api::all(self.client.clone());
        let out = api.create(&PostParams::default(), &review).await?;
        let rules = out
            .status
            .map(|s| s.resource_rules)
            .unwrap_or_default()
            .into_iter()
            .map(|r| PermissionRule {
                verbs: r.verbs,
                api_groups: r.api_groups.unwrap_or_default(),
                resources: r.resources.unwrap_or_default(),
            })
            .collect();
        Ok(rules)
    }

    fn invalidate(&self) { self.registry.invalidate(); }
}

/// Typed access to the managed resource.
pub struct KubeManagedApi<K> {
    client: Client,
    _k: PhantomData<fn() -> K>,
}

impl<K> KubeManagedApi<K> {
    pub fn new(client: Client) -> Self { Self { client, _k: PhantomData } }
}

fn name_of<K: ManagedObject>(obj: &K) -> StoreResult<(String, String)> {
    let meta = obj.meta();
    let ns = meta.namespace.clone().ok_or_else(|| StoreError::Invalid("managed resource without namespace".into()))?;
    let name = meta.name.clone().ok_or_else(|| StoreError::Invalid("managed resource without name".into()))?;
    Ok((ns, name))
}

#[async_trait]
impl<K: ManagedObject> crate::ManagedApi<K> for KubeManagedApi<K> {
    async fn get(&self, key: &ReconcileKey) -> StoreResult<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let (ns, name) = name_of(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let (ns, name) = name_of(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        // resourceVersion in the patch makes the server reject stale writes with 409
        let patch = json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": obj.status(),
        });
        Ok(api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)).await?)
    }
}
