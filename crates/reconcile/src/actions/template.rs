use anyhow::Result;
use async_trait::async_trait;
use keel_core::ManagedObject;
use tracing::debug;

use crate::{Action, ReconciliationRequest};

/// Loads the template for the pass and records its identity in status.
#[derive(Debug, Default)]
pub struct TemplateAction;

#[async_trait]
impl<K: ManagedObject> Action<K> for TemplateAction {
    fn name(&self) -> &'static str { "template" }

    async fn run(&self, rr: &mut ReconciliationRequest<K>) -> Result<()> {
        let identity = rr.template().await?.identity();
        debug!(name = %identity.name, version = %identity.version, "template loaded");
        rr.resource.status_mut().template_identity = Some(identity);
        Ok(())
    }
}
