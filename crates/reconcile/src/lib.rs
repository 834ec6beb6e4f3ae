//! Keel reconcile: the per-resource state machine and its action pipeline.
//!
//! A [`Reconciler`] loads the managed resource, enforces the singleton rule,
//! drives the finalizer lifecycle and runs an ordered list of [`Action`]s
//! against a [`ReconciliationRequest`], then folds the outcome into status.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use keel_core::ManagedObject;
use keel_kubehub::StoreError;

pub mod actions;
pub mod reconciler;
pub mod request;

pub use actions::{
    instance_type, ApplyCrdsAction, ApplyResourcesAction, ConditionsAction, DelegateAction, MirrorStatusAction, TemplateAction,
};
pub use reconciler::{Outcome, Reconciler};
pub use request::ReconciliationRequest;

pub const DEFAULT_NAME: &str = "runtime-instance";
pub const DEFAULT_NAMESPACE: &str = "keel-system";
pub const NAMESPACE_ENV: &str = "KEEL_OPERATOR_NAMESPACE";
pub const FINALIZER: &str = "instance.operator.keel.dev/finalizer";
pub const FIELD_MANAGER: &str = "keel-operator";
pub const CONTROL_PLANE_NAME: &str = "control-plane";
pub const CONTROL_PLANE_FINALIZER: &str = "controlplane.operator.keel.dev/finalizer";

/// Where the singleton lives and how this controller signs its writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub name: String,
    pub namespace: String,
    pub finalizer: String,
    pub field_manager: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            finalizer: FINALIZER.to_string(),
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Defaults with the namespace taken from `KEEL_OPERATOR_NAMESPACE` when set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(ns) = std::env::var(NAMESPACE_ENV) {
            if !ns.trim().is_empty() { cfg.namespace = ns.trim().to_string(); }
        }
        cfg
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Same namespace and field manager, for the `ControlPlane` singleton.
    pub fn control_plane(&self) -> Self {
        Self {
            name: CONTROL_PLANE_NAME.to_string(),
            finalizer: CONTROL_PLANE_FINALIZER.to_string(),
            ..self.clone()
        }
    }
}

/// One step of the pipeline. `run` is called in registration order on every
/// pass; `cleanup` in reverse order when the resource is being deleted.
#[async_trait]
pub trait Action<K: ManagedObject>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, rr: &mut ReconciliationRequest<K>) -> anyhow::Result<()>;

    async fn cleanup(&self, _rr: &mut ReconciliationRequest<K>) -> anyhow::Result<()> { Ok(()) }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{}", join_errors(.0))]
    Actions(Vec<anyhow::Error>),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cleanup failed: {}", chain(.0))]
    Cleanup(anyhow::Error),
}

fn chain(e: &anyhow::Error) -> String { format!("{:#}", e) }

fn join_errors(errs: &[anyhow::Error]) -> String {
    errs.iter().map(chain).collect::<Vec<_>>().join("; ")
}
