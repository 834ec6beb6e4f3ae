//! The state machine: singleton guard, finalizer lifecycle, action pipeline, status.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use keel_apply::TemplateEngine;
use keel_core::conditions::{REASON_FAILURE, REASON_RECONCILED, REASON_UNSUPPORTED_CONFIGURATION, TYPE_RECONCILED};
use keel_core::{Condition, ConditionStatus, ManagedObject, Phase, ReconcileKey};
use keel_kubehub::{ManagedApi, ObjectStore, StoreError};
use kube::Resource;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::{Action, OperatorConfig, ReconcileError, ReconciliationRequest};

/// What the dispatcher should do with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Retry soon; an optimistic-concurrency conflict lost a write.
    Requeue,
}

pub struct Reconciler<K: ManagedObject> {
    cfg: OperatorConfig,
    api: Arc<dyn ManagedApi<K>>,
    store: Arc<dyn ObjectStore>,
    engine: Arc<dyn TemplateEngine>,
    actions: Vec<Box<dyn Action<K>>>,
}

impl<K: ManagedObject> Reconciler<K> {
    pub fn new(cfg: OperatorConfig, api: Arc<dyn ManagedApi<K>>, store: Arc<dyn ObjectStore>, engine: Arc<dyn TemplateEngine>) -> Self {
        Self { cfg, api, store, engine, actions: Vec::new() }
    }

    pub fn with_action(mut self, action: impl Action<K> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn config(&self) -> &OperatorConfig { &self.cfg }

    pub fn action_names(&self) -> Vec<&'static str> { self.actions.iter().map(|a| a.name()).collect() }

    fn expected(&self) -> ReconcileKey { ReconcileKey::new(&self.cfg.namespace, &self.cfg.name) }

    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.reconcile_inner(key).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("reconcile_errors_total", 1u64);
        }
        res
    }

    async fn reconcile_inner(&self, key: &ReconcileKey) -> Result<Outcome, ReconcileError> {
        let Some(mut resource) = self.api.get(key).await? else {
            debug!(%key, "managed resource gone");
            return Ok(Outcome::Done);
        };

        if *key != self.expected() {
            return self.reject(resource).await;
        }

        if resource.is_deleting() {
            return self.finalize(resource).await;
        }

        if !resource.has_finalizer(&self.cfg.finalizer) {
            resource.meta_mut().finalizers.get_or_insert_with(Vec::new).push(self.cfg.finalizer.clone());
            resource = match self.api.update(&resource).await {
                Ok(r) => r,
                Err(StoreError::Conflict(msg)) => {
                    info!(%key, %msg, "conflict adding finalizer");
                    return Ok(Outcome::Requeue);
                }
                Err(e) => return Err(e.into()),
            };
        }

        info!(%key, gen = resource.generation(), "reconciling");
        let mut rr = ReconciliationRequest::new(resource, self.store.clone(), self.engine.clone());
        let mut errs = Vec::new();
        for a in &self.actions {
            if let Err(e) = a.run(&mut rr).await {
                warn!(action = a.name(), error = %format!("{:#}", e), "action failed");
                errs.push(e.context(format!("action {}", a.name())));
            }
        }

        let gen = rr.resource.generation();
        let status = rr.resource.status_mut();
        let cond = if errs.is_empty() {
            status.observed_generation = gen;
            status.phase = Some(Phase::Ready);
            Condition::new(TYPE_RECONCILED, ConditionStatus::True, REASON_RECONCILED, REASON_RECONCILED)
        } else {
            status.phase = Some(Phase::Error);
            Condition::new(TYPE_RECONCILED, ConditionStatus::False, REASON_FAILURE, REASON_FAILURE)
        };
        status.set_condition(cond.with_generation(gen));
        status.sort_conditions();

        let mut outcome = Outcome::Done;
        match self.api.update_status(&rr.resource).await {
            Ok(_) => {}
            Err(StoreError::Conflict(msg)) => {
                info!(%key, %msg, "conflict writing status");
                outcome = Outcome::Requeue;
            }
            Err(e) => errs.push(anyhow!(e).context(format!("cannot update status of {}", key))),
        }

        if errs.is_empty() { Ok(outcome) } else { Err(ReconcileError::Actions(errs)) }
    }

    /// Singleton guard: anything but the configured name/namespace is parked in Error.
    async fn reject(&self, mut resource: K) -> Result<Outcome, ReconcileError> {
        let key = resource.key();
        warn!(%key, expected = %self.expected(), "unsupported resource");
        let msg = format!(
            "Unsupported resource, the operator handles a single {} resource named {} in namespace {}",
            K::kind(&()),
            self.cfg.name,
            self.cfg.namespace
        );
        let status = resource.status_mut();
        status.phase = Some(Phase::Error);
        status.set_condition(Condition::new(TYPE_RECONCILED, ConditionStatus::False, REASON_UNSUPPORTED_CONFIGURATION, msg));
        status.sort_conditions();
        match self.api.update_status(&resource).await {
            Ok(_) => Ok(Outcome::Done),
            Err(StoreError::Conflict(msg)) => {
                info!(%key, %msg, "conflict writing status");
                Ok(Outcome::Requeue)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deleting: run cleanups in reverse registration order, then release the finalizer.
    async fn finalize(&self, resource: K) -> Result<Outcome, ReconcileError> {
        let key = resource.key();
        if !resource.has_finalizer(&self.cfg.finalizer) {
            return Ok(Outcome::Done);
        }
        info!(%key, "cleanup");
        let mut rr = ReconciliationRequest::new(resource, self.store.clone(), self.engine.clone());
        for a in self.actions.iter().rev() {
            a.cleanup(&mut rr)
                .await
                .map_err(|e| ReconcileError::Cleanup(e.context(format!("action {}", a.name()))))?;
        }

        let mut resource = rr.resource;
        if let Some(f) = resource.meta_mut().finalizers.as_mut() {
            f.retain(|n| n != &self.cfg.finalizer);
        }
        match self.api.update(&resource).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(Outcome::Done),
            Err(StoreError::Conflict(msg)) => {
                info!(%key, %msg, "conflict removing finalizer");
                Ok(Outcome::Requeue)
            }
            Err(e) => Err(e.into()),
        }
    }
}
