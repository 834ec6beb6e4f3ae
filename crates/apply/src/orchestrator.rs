//! Render the desired object set, stamp it, apply it, collect what it replaced.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_core::{kinds, labels, ManagedObject, Release, TemplateIdentity, TypeKey};
use keel_gc::{release_selector, superseded, Collector};
use keel_kubehub::{object_ref, EventPublisher, ObjectStore, Propagation, Scope, StoreError};
use keel_watch::{Routing, SubscriptionManager};
use kube::core::DynamicObject;
use kube::runtime::events::EventType;
use kube::Resource;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::values::{default_customizers, default_overrides, merge_values, ValuesCustomizer};
use crate::Template;

pub const EVENT_RENDER_FULL_TEMPLATE: &str = "RenderFullTemplate";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub force: bool,
    pub applied: usize,
    pub skipped: usize,
    /// Set when a collection pass ran.
    pub gc_deleted: Option<usize>,
}

/// Why a full render is needed, if it is. A missing previous identity counts
/// as a change.
pub fn force_reason(generation: i64, observed: i64, identity: &TemplateIdentity, previous: Option<&TemplateIdentity>) -> Option<String> {
    if generation != observed {
        return Some(format!("spec changed (observedGeneration: {}, generation: {})", observed, generation));
    }
    match previous {
        Some(p) if p == identity => None,
        Some(p) => Some(format!("template changed ({}@{} -> {}@{})", p.name, p.version, identity.name, identity.version)),
        None => Some("no template recorded in status".to_string()),
    }
}

fn sort_key(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    format!("{}:{}", kind, obj.metadata.name.as_deref().unwrap_or(""))
}

pub fn release_of<K: ManagedObject>(resource: &K) -> Release {
    let key = resource.key();
    Release { name: key.name, namespace: key.namespace, revision: resource.generation() }
}

fn join(what: &str, errs: Vec<anyhow::Error>) -> anyhow::Error {
    let msgs: Vec<String> = errs.iter().map(|e| format!("{:#}", e)).collect();
    anyhow!("{} {} failed: {}", errs.len(), what, msgs.join("; "))
}

pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    subs: Arc<SubscriptionManager>,
    gc: Arc<Collector>,
    events: Arc<dyn EventPublisher>,
    field_manager: String,
    overrides: Json,
    customizers: Vec<Arc<dyn ValuesCustomizer>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        subs: Arc<SubscriptionManager>,
        gc: Arc<Collector>,
        events: Arc<dyn EventPublisher>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            store,
            subs,
            gc,
            events,
            field_manager: field_manager.into(),
            overrides: default_overrides(),
            customizers: default_customizers(),
        }
    }

    pub fn with_overrides(mut self, overrides: Json) -> Self {
        self.overrides = overrides;
        self
    }

    /// Run `c` after the ones already registered.
    pub fn with_customizer(mut self, c: Arc<dyn ValuesCustomizer>) -> Self {
        self.customizers.push(c);
        self
    }

    pub fn customizer_names(&self) -> Vec<&'static str> { self.customizers.iter().map(|c| c.name()).collect() }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }

    pub fn field_manager(&self) -> &str { &self.field_manager }

    /// Values handed to the template: user values under the overrides, then customized.
    pub fn values<K: ManagedObject>(&self, resource: &K) -> Result<Json> {
        let mut values = merge_values(resource.values().unwrap_or(&Json::Null), &self.overrides);
        for c in &self.customizers {
            values = c.customize(values).with_context(|| format!("customizer {} failed", c.name()))?;
        }
        Ok(values)
    }

    /// Render with customized values, ordered by `kind:name`.
    pub fn render<K: ManagedObject>(&self, resource: &K, template: &dyn Template) -> Result<Vec<DynamicObject>> {
        let values = self.values(resource)?;
        let mut items = template.render(&release_of(resource), &values).context("cannot render template")?;
        items.sort_by_cached_key(sort_key);
        Ok(items)
    }

    /// Stamp release labels. The namespace label is set on every object so
    /// cluster-scoped ones can be routed back.
    pub fn stamp<K: ManagedObject>(&self, resource: &K, identity: &TemplateIdentity, obj: &mut DynamicObject) {
        let key = resource.key();
        let l = obj.metadata.labels.get_or_insert_with(Default::default);
        l.insert(labels::RELEASE_NAME.to_string(), key.name);
        l.insert(labels::RELEASE_NAMESPACE.to_string(), key.namespace);
        l.insert(labels::RELEASE_VERSION.to_string(), identity.release_version().to_string());
        l.insert(labels::RELEASE_GENERATION.to_string(), resource.generation().to_string());
    }

    pub async fn apply<K: ManagedObject>(&self, resource: &K, template: &dyn Template, previous: Option<&TemplateIdentity>) -> Result<ApplyReport> {
        let t0 = Instant::now();
        let items = self.render(resource, template)?;
        let identity = template.identity();
        let gen = resource.generation();
        let reason = force_reason(gen, resource.observed_generation(), &identity, previous);
        let force = reason.is_some();
        if let Some(reason) = reason {
            info!(gen, %reason, "full render");
            let note = format!("render full template as {}", reason);
            self.events.publish(&resource.object_ref(&()), EventType::Normal, EVENT_RENDER_FULL_TEMPLATE, "Reconcile", Some(note)).await;
        }

        let rk = resource.key();
        let owner = resource.controller_owner_ref(&()).ok_or_else(|| anyhow!("managed resource {} has no uid", rk))?;
        let owner_routing = Routing::Owner { api_version: K::api_version(&()).to_string(), kind: K::kind(&()).to_string() };

        let mut report = ApplyReport { force, ..ApplyReport::default() };
        let mut failures = Vec::new();
        for mut obj in items {
            let key = TypeKey::of(&obj).ok_or_else(|| anyhow!("rendered object {} without apiVersion/kind", sort_key(&obj)))?;
            self.stamp(resource, &identity, &mut obj);
            let scope = self.store.scope_of(&key).await.with_context(|| format!("cannot resolve type {}", key))?;
            match scope {
                Scope::Namespaced => {
                    obj.metadata.namespace = Some(rk.namespace.clone());
                    obj.metadata.owner_references = Some(vec![owner.clone()]);
                    self.subs.ensure_watch(&key, owner_routing.clone()).await?;
                }
                Scope::Cluster => {
                    obj.metadata.namespace = None;
                    self.subs.ensure_watch(&key, Routing::Labels).await?;
                }
            }
            let r = object_ref(&obj);
            let name = obj.metadata.name.clone().unwrap_or_default();

            if !force && kinds::is_install_only(&key) {
                let existing = self.store.get(&key, obj.metadata.namespace.as_deref(), &name).await.with_context(|| format!("cannot get object {}", r))?;
                if existing.is_some() {
                    info!(apply = false, obj = %r, reason = "resource marked as install-only", "run");
                    counter!("apply_install_only_skipped", 1u64);
                    report.skipped += 1;
                    continue;
                }
            }

            match self.store.apply(&obj, &self.field_manager, true).await {
                Ok(_) => {
                    info!(apply = true, gen, obj = %r, "run");
                    counter!("apply_ok", 1u64);
                    report.applied += 1;
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    failures.push(anyhow!(e).context(format!("cannot patch object {}", r)));
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if !failures.is_empty() {
            // an incomplete desired set must not drive a collection pass
            return Err(join("objects", failures));
        }

        if force {
            let version = identity.release_version().to_string();
            // the selector leaves version out so older versions are listed too;
            // `superseded` decides on version and generation
            let selector = release_selector(&rk.name, None);
            let deleted = self
                .gc
                .run(self.store.as_ref(), &rk.namespace, &selector, move |o| superseded(o, gen, &version))
                .await
                .context("cannot run gc")?;
            info!(deleted, "gc");
            report.gc_deleted = Some(deleted);
        }
        Ok(report)
    }

    /// Delete the cluster-scoped part of the render. Namespaced objects follow
    /// the managed resource through their owner reference.
    pub async fn cleanup<K: ManagedObject>(&self, resource: &K, template: &dyn Template) -> Result<usize> {
        let mut deleted = 0usize;
        for obj in self.render(resource, template)? {
            let key = TypeKey::of(&obj).ok_or_else(|| anyhow!("rendered object {} without apiVersion/kind", sort_key(&obj)))?;
            if self.store.scope_of(&key).await.with_context(|| format!("cannot resolve type {}", key))? != Scope::Cluster {
                continue;
            }
            let r = object_ref(&obj);
            let name = obj.metadata.name.clone().unwrap_or_default();
            match self.store.delete(&key, None, &name, Propagation::Foreground).await {
                Ok(()) => {
                    info!(obj = %r, "delete");
                    deleted += 1;
                }
                Err(StoreError::NotFound(_)) => debug!(obj = %r, "already gone"),
                Err(e) => return Err(anyhow!(e).context(format!("cannot delete object {}", r))),
            }
        }
        Ok(deleted)
    }
}
