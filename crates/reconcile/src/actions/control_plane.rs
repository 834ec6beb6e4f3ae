//! Control plane delegation: a `ControlPlane` is turned into the singleton
//! `RuntimeInstance` and that instance's status is mirrored back.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use keel_core::{ControlPlane, ManagedObject, ManagedStatus, RuntimeInstance, TypeKey};
use keel_kubehub::object_ref;
use kube::core::DynamicObject;
use kube::Resource;
use serde_json::json;
use tracing::{debug, info};

use crate::{Action, ReconciliationRequest};

pub fn instance_type() -> TypeKey {
    TypeKey::new(RuntimeInstance::group(&()), RuntimeInstance::version(&()), RuntimeInstance::kind(&()))
}

/// Server-side applies the runtime instance, owned by the control plane.
pub struct DelegateAction {
    instance_name: String,
    field_manager: String,
}

impl DelegateAction {
    pub fn new(instance_name: impl Into<String>, field_manager: impl Into<String>) -> Self {
        Self { instance_name: instance_name.into(), field_manager: field_manager.into() }
    }

    /// The instance as this controller declares it: name, owner and values.
    pub fn desired(&self, cp: &ControlPlane) -> Result<DynamicObject> {
        let key = cp.key();
        let owner = cp.controller_owner_ref(&()).ok_or_else(|| anyhow!("control plane {} has no uid", key))?;
        let mut spec = serde_json::Map::new();
        if let Some(v) = cp.spec.values.as_ref() {
            spec.insert("values".to_string(), v.clone());
        }
        serde_json::from_value(json!({
            "apiVersion": RuntimeInstance::api_version(&()),
            "kind": RuntimeInstance::kind(&()),
            "metadata": { "name": self.instance_name.as_str(), "namespace": key.namespace, "ownerReferences": [owner] },
            "spec": spec,
        }))
        .context("cannot build runtime instance")
    }
}

#[async_trait]
impl Action<ControlPlane> for DelegateAction {
    fn name(&self) -> &'static str { "delegate" }

    async fn run(&self, rr: &mut ReconciliationRequest<ControlPlane>) -> Result<()> {
        let obj = self.desired(&rr.resource)?;
        let r = object_ref(&obj);
        rr.store
            .apply(&obj, &self.field_manager, true)
            .await
            .with_context(|| format!("failure to apply changes to {}", r))?;
        info!(obj = %r, "delegated");
        Ok(())
    }
}

/// Copies conditions and template identity from the runtime instance.
pub struct MirrorStatusAction {
    instance_name: String,
}

impl MirrorStatusAction {
    pub fn new(instance_name: impl Into<String>) -> Self { Self { instance_name: instance_name.into() } }
}

#[async_trait]
impl Action<ControlPlane> for MirrorStatusAction {
    fn name(&self) -> &'static str { "mirror-status" }

    async fn run(&self, rr: &mut ReconciliationRequest<ControlPlane>) -> Result<()> {
        let ns = rr.resource.key().namespace;
        let found = rr
            .store
            .get(&instance_type(), Some(&ns), &self.instance_name)
            .await
            .with_context(|| format!("failure to lookup resource {}/{}", ns, self.instance_name))?;
        let Some(raw) = found.and_then(|o| o.data.get("status").cloned()).filter(|s| !s.is_null()) else {
            debug!(namespace = %ns, name = %self.instance_name, "no instance status yet");
            return Ok(());
        };
        let st: ManagedStatus = serde_json::from_value(raw).context("cannot decode runtime instance status")?;
        let own = rr.resource.status_mut();
        for c in st.conditions {
            own.set_condition(c);
        }
        own.template_identity = st.template_identity;
        Ok(())
    }
}
