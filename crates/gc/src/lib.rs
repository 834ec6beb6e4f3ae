//! Keel gc: generational garbage collection of generated objects.
//!
//! Owner references cannot reach cluster-scoped objects, and they do not
//! notice an object that moved scope between two renders. After a forced
//! render the collector sweeps every type it may delete and removes objects
//! whose release labels say they belong to an older render.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use keel_core::{labels, TypeKey};
use keel_kubehub::{object_ref, DiscoveredType, LabelSelector, ObjectStore, Propagation, StoreError};
use kube::core::DynamicObject;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Minimum spacing between discovery + permission refreshes.
    pub refresh_interval: Duration,
    /// Never collected, whatever the permissions say.
    pub deny: Vec<TypeKey>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            deny: vec![TypeKey::new("coordination.k8s.io", "v1", "Lease")],
        }
    }
}

impl GcConfig {
    fn denied(&self, key: &TypeKey) -> bool {
        // leases are denied across versions
        self.deny.iter().any(|d| d.group == key.group && d.kind == key.kind)
    }
}

#[derive(Default)]
struct GcState {
    collectable: Vec<DiscoveredType>,
    last_refresh: Option<Instant>,
}

pub struct Collector {
    cfg: GcConfig,
    state: Mutex<GcState>,
}

impl Default for Collector {
    fn default() -> Self { Self::new(GcConfig::default()) }
}

impl Collector {
    pub fn new(cfg: GcConfig) -> Self { Self { cfg, state: Mutex::new(GcState::default()) } }

    /// Snapshot of the cached collectable types.
    pub async fn collectable(&self) -> Vec<TypeKey> {
        self.state.lock().await.collectable.iter().map(|t| t.key.clone()).collect()
    }

    /// One collection pass. Only one pass runs at a time; callers queue on the lock.
    /// `namespace` scopes the permission review and the listing of namespaced types.
    /// Returns the number of objects deleted.
    pub async fn run<P>(&self, store: &dyn ObjectStore, namespace: &str, selector: &LabelSelector, predicate: P) -> Result<usize>
    where
        P: Fn(&DynamicObject) -> Result<bool> + Send + Sync,
    {
        let mut st = self.state.lock().await;
        self.refresh(store, namespace, &mut st).await.context("cannot discover collectable types")?;

        let mut deleted = 0usize;
        for t in st.collectable.iter() {
            let list_ns = match t.scope {
                keel_kubehub::Scope::Namespaced => Some(namespace),
                keel_kubehub::Scope::Cluster => None,
            };
            let items = match store.list(&t.key, list_ns, selector).await {
                Ok(items) => items,
                Err(e) if e.is_forbidden() => {
                    info!(kind = %t.key, "cannot gc, forbidden");
                    continue;
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(anyhow!(e).context(format!("cannot list child resources {}", t.key))),
            };
            for obj in items.iter() {
                if !predicate(obj)? { continue; }
                let name = obj.metadata.name.as_deref().unwrap_or_default();
                let r = object_ref(obj);
                info!(obj = %r, "deleting");
                match store.delete(&t.key, obj.metadata.namespace.as_deref(), name, Propagation::Foreground).await {
                    Ok(()) => info!(obj = %r, "deleted"),
                    Err(StoreError::NotFound(_)) => debug!(obj = %r, "already gone"),
                    Err(e) if e.is_forbidden() => {
                        warn!(obj = %r, "delete forbidden; skipping");
                        continue;
                    }
                    Err(e) => return Err(anyhow!(e).context(format!("cannot delete {}", r))),
                }
                deleted += 1;
            }
        }
        counter!("gc_deleted_total", deleted as u64);
        Ok(deleted)
    }

    async fn refresh(&self, store: &dyn ObjectStore, namespace: &str, st: &mut GcState) -> Result<()> {
        if let Some(at) = st.last_refresh {
            if at.elapsed() < self.cfg.refresh_interval { return Ok(()); }
        }
        let discovered = store.discover("delete").await.context("discovery")?;
        for g in &discovered.failed_groups {
            debug!(group = %g, "group discovery failed; skipped");
        }
        let rules = store.self_rules(namespace).await.context("unable to review own permissions")?;
        let mut collectable: Vec<DiscoveredType> = discovered
            .types
            .into_iter()
            .filter(|t| !self.cfg.denied(&t.key))
            .filter(|t| rules.iter().any(|r| r.allows("delete", &t.key.group, &t.plural)))
            .collect();
        collectable.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        collectable.dedup_by(|a, b| a.key == b.key);
        debug!(types = collectable.len(), "collectable types refreshed");
        counter!("gc_discovery_refresh_total", 1u64);
        st.collectable = collectable;
        st.last_refresh = Some(Instant::now());
        Ok(())
    }
}

/// Selector for every object of a release that carries a generation label.
/// Pass `None` for `version` when pairing it with [`superseded`], which
/// compares versions itself.
pub fn release_selector(release_name: &str, version: Option<&str>) -> LabelSelector {
    let s = LabelSelector::new().eq(labels::RELEASE_NAME, release_name).exists(labels::RELEASE_GENERATION);
    match version {
        Some(v) => s.eq(labels::RELEASE_VERSION, v),
        None => s,
    }
}

/// True when `obj` was rendered by an older generation or a different template
/// version. Objects missing either label are never superseded.
pub fn superseded(obj: &DynamicObject, generation: i64, version: &str) -> Result<bool> {
    let Some(l) = obj.metadata.labels.as_ref() else { return Ok(false) };
    let gen = l.get(labels::RELEASE_GENERATION).map(String::as_str).unwrap_or("");
    let ver = l.get(labels::RELEASE_VERSION).map(String::as_str).unwrap_or("");
    if gen.is_empty() || ver.is_empty() { return Ok(false); }
    if ver != version { return Ok(true); }
    let g: i64 = gen.parse().with_context(|| format!("cannot determine release generation of {}", object_ref(obj)))?;
    Ok(generation > g)
}
