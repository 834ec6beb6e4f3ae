use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::conditions::{REASON_IN_PROGRESS, REASON_READY, TYPE_READY};
use keel_core::{labels, Condition, ConditionStatus, ManagedObject, TypeKey};
use keel_kubehub::LabelSelector;
use kube::core::DynamicObject;

use crate::{Action, ReconciliationRequest};

/// Derives the `Ready` condition from the workloads of the current release.
#[derive(Debug, Default)]
pub struct ConditionsAction;

fn deployment_available(obj: &DynamicObject) -> bool {
    obj.data["status"]["conditions"]
        .as_array()
        .map(|cs| cs.iter().any(|c| c["type"] == "Available" && c["status"] == "True"))
        .unwrap_or(false)
}

fn statefulset_ready(obj: &DynamicObject) -> bool {
    let replicas = obj.data["status"]["replicas"].as_i64().unwrap_or(0);
    let ready = obj.data["status"]["readyReplicas"].as_i64().unwrap_or(0);
    replicas > 0 && ready == replicas
}

/// Ready condition for the given workloads.
pub fn readiness(deployments: &[DynamicObject], statefulsets: &[DynamicObject], generation: i64) -> Condition {
    let total = deployments.len() + statefulsets.len();
    if total == 0 {
        return Condition::new(TYPE_READY, ConditionStatus::False, REASON_IN_PROGRESS, "no deployments/replicasets").with_generation(generation);
    }
    let d = deployments.iter().filter(|o| deployment_available(o)).count();
    let s = statefulsets.iter().filter(|o| statefulset_ready(o)).count();
    let msg = format!("{}/{} deployments ready, statefulSets ready {}/{}", d, deployments.len(), s, statefulsets.len());
    let c = if d + s == total {
        Condition::new(TYPE_READY, ConditionStatus::True, REASON_READY, msg)
    } else {
        Condition::new(TYPE_READY, ConditionStatus::False, REASON_IN_PROGRESS, msg)
    };
    c.with_generation(generation)
}

#[async_trait]
impl<K: ManagedObject> Action<K> for ConditionsAction {
    fn name(&self) -> &'static str { "conditions" }

    async fn run(&self, rr: &mut ReconciliationRequest<K>) -> Result<()> {
        let key = rr.resource.key();
        let gen = rr.resource.generation();
        let sel = LabelSelector::new()
            .eq(labels::RELEASE_NAMESPACE, &key.namespace)
            .eq(labels::RELEASE_NAME, &key.name)
            .eq(labels::RELEASE_GENERATION, gen.to_string());

        let deployments = rr
            .store
            .list(&TypeKey::new("apps", "v1", "Deployment"), Some(&key.namespace), &sel)
            .await
            .context("cannot list deployments")?;
        let statefulsets = rr
            .store
            .list(&TypeKey::new("apps", "v1", "StatefulSet"), Some(&key.namespace), &sel)
            .await
            .context("cannot list stateful sets")?;

        rr.resource.status_mut().set_condition(readiness(&deployments, &statefulsets, gen));
        Ok(())
    }
}
