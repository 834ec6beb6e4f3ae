use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use keel_apply::Orchestrator;
use keel_core::ManagedObject;
use tracing::info;

use crate::{Action, ReconciliationRequest};

/// Renders and applies the template through the orchestrator; on deletion
/// removes the cluster-scoped part of the render.
pub struct ApplyResourcesAction {
    orchestrator: Arc<Orchestrator>,
}

impl ApplyResourcesAction {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self { Self { orchestrator } }
}

#[async_trait]
impl<K: ManagedObject> Action<K> for ApplyResourcesAction {
    fn name(&self) -> &'static str { "apply-resources" }

    async fn run(&self, rr: &mut ReconciliationRequest<K>) -> Result<()> {
        let template = rr.template().await?;
        let report = self.orchestrator.apply(&rr.resource, template.as_ref(), rr.previous_identity.as_ref()).await?;
        info!(force = report.force, applied = report.applied, skipped = report.skipped, gc = ?report.gc_deleted, "applied");
        Ok(())
    }

    async fn cleanup(&self, rr: &mut ReconciliationRequest<K>) -> Result<()> {
        let template = rr.template().await?;
        let deleted = self.orchestrator.cleanup(&rr.resource, template.as_ref()).await?;
        info!(deleted, "cleanup");
        Ok(())
    }
}
