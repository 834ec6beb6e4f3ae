use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use keel_core::{labels, ManagedObject, TypeKey};
use keel_kubehub::object_ref;
use tracing::info;

use crate::{Action, ReconciliationRequest};

/// Applies the CRDs shipped with the template ahead of the rendered objects.
///
/// A CRD is applied when the resource generation moved or the CRD is missing.
/// CRDs carry the release name, namespace and generation labels but no version
/// label, so a template upgrade alone never makes them collectable.
pub struct ApplyCrdsAction {
    field_manager: String,
}

impl ApplyCrdsAction {
    pub fn new(field_manager: impl Into<String>) -> Self { Self { field_manager: field_manager.into() } }
}

#[async_trait]
impl<K: ManagedObject> Action<K> for ApplyCrdsAction {
    fn name(&self) -> &'static str { "apply-crds" }

    async fn run(&self, rr: &mut ReconciliationRequest<K>) -> Result<()> {
        let template = rr.template().await?;
        let mut crds = template.crds().context("cannot read template CRDs")?;
        crds.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let gen = rr.resource.generation();
        let changed = gen != rr.resource.observed_generation();
        let key = rr.resource.key();
        for mut crd in crds {
            let r = object_ref(&crd);
            let tk = TypeKey::of(&crd).ok_or_else(|| anyhow!("CRD {} without apiVersion/kind", r))?;
            let name = crd.metadata.name.clone().unwrap_or_default();
            let l = crd.metadata.labels.get_or_insert_with(Default::default);
            l.insert(labels::RELEASE_GENERATION.to_string(), gen.to_string());
            l.insert(labels::RELEASE_NAME.to_string(), key.name.clone());
            l.insert(labels::RELEASE_NAMESPACE.to_string(), key.namespace.clone());

            let missing = rr
                .store
                .get(&tk, None, &name)
                .await
                .with_context(|| format!("cannot determine if CRD {} exists", r))?
                .is_none();
            if !changed && !missing {
                info!(apply = false, gen, obj = %r, "run");
                continue;
            }
            rr.store.apply(&crd, &self.field_manager, true).await.with_context(|| format!("cannot apply CRD {}", r))?;
            info!(apply = true, gen, obj = %r, "run");
        }

        // newly served kinds must resolve on the next lookup
        rr.store.invalidate();
        Ok(())
    }
}
