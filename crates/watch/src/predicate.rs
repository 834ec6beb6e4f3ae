//! Change predicates deciding which watch events become reconcile triggers.

use keel_core::labels;
use keel_kubehub::WatchEvent;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, trace};

/// Per-type knobs for dependent objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchPolicy {
    pub watch_update: bool,
    pub watch_delete: bool,
    /// Keep `status` when comparing old and new.
    pub watch_status: bool,
}

impl Default for WatchPolicy {
    fn default() -> Self { Self { watch_update: true, watch_delete: true, watch_status: false } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Both release labels must be present for an object to be one of ours.
pub fn has_release_labels(obj: &DynamicObject) -> bool {
    let Some(l) = obj.metadata.labels.as_ref() else { return false };
    l.contains_key(labels::RELEASE_NAME) && l.contains_key(labels::RELEASE_NAMESPACE)
}

/// Drop server bookkeeping before a structural comparison.
pub fn strip_noisy(mut v: Json, keep_status: bool) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
    }
    if !keep_status {
        if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                s.updates += (0..min_len).filter(|&i| aa[i] != bb[i]).count();
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Filter for generated objects: creates never trigger, deletes follow the
/// policy, updates trigger only on a genuine structural change.
pub fn dependent_changed(ev: &WatchEvent, policy: &WatchPolicy) -> bool {
    match ev {
        WatchEvent::Created(_) => false,
        WatchEvent::Deleted(_) => policy.watch_delete,
        WatchEvent::Updated { old, new } => {
            if !policy.watch_update { return false; }
            if old.metadata.resource_version == new.metadata.resource_version { return false; }
            let (Ok(o), Ok(n)) = (serde_json::to_value(old), serde_json::to_value(new)) else { return true };
            let o = strip_noisy(o, policy.watch_status);
            let n = strip_noisy(n, policy.watch_status);
            if o == n {
                trace!(name = ?new.metadata.name, "no structural change");
                return false;
            }
            let d = diff_summary(&n, &o);
            debug!(name = ?new.metadata.name, adds = d.adds, updates = d.updates, removes = d.removes, "diff");
            true
        }
    }
}

/// Filter for the managed type itself: create, delete and spec edits.
pub fn generation_changed(ev: &WatchEvent) -> bool {
    match ev {
        WatchEvent::Created(_) | WatchEvent::Deleted(_) => true,
        WatchEvent::Updated { old, new } => old.metadata.generation != new.metadata.generation,
    }
}

/// Filter for delegated managed resources: like [`generation_changed`], and
/// also any change to `status`.
pub fn generation_or_status_changed(ev: &WatchEvent) -> bool {
    match ev {
        WatchEvent::Created(_) | WatchEvent::Deleted(_) => true,
        WatchEvent::Updated { old, new } => {
            old.metadata.generation != new.metadata.generation || old.data.get("status") != new.data.get("status")
        }
    }
}
