use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_apply::{Orchestrator, Template, TemplateEngine, TemplateError, EVENT_RENDER_FULL_TEMPLATE};
use keel_core::conditions::{REASON_FAILURE, REASON_UNSUPPORTED_CONFIGURATION, TYPE_READY, TYPE_RECONCILED};
use keel_core::{
    Condition, ConditionStatus, Credentials, ManagedObject, Phase, ReconcileKey, Release, RuntimeInstance, RuntimeInstanceSpec, TemplateIdentity,
    TemplateRef, TemplateSpec, TypeKey,
};
use keel_gc::Collector;
use keel_kubehub::{Call, MemoryManagedApi, MemoryStore, RecordingPublisher};
use keel_reconcile::{
    Action, ApplyCrdsAction, ApplyResourcesAction, ConditionsAction, OperatorConfig, Outcome, ReconcileError, Reconciler,
    ReconciliationRequest, TemplateAction, FIELD_MANAGER,
};
use keel_watch::SubscriptionManager;
use kube::core::DynamicObject;
use serde_json::{json, Value};
use tokio::sync::mpsc;

const NS: &str = "keel-system";
const NAME: &str = "runtime-instance";

struct StaticTemplate;

fn obj(v: Value) -> Result<DynamicObject, TemplateError> { serde_json::from_value(v).map_err(|e| TemplateError::Render(e.to_string())) }

impl Template for StaticTemplate {
    fn identity(&self) -> TemplateIdentity { TemplateIdentity { name: "runtime".into(), source: String::new(), version: "1.0.0".into() } }

    fn render(&self, release: &Release, values: &Value) -> Result<Vec<DynamicObject>, TemplateError> {
        let mut out = vec![
            obj(json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "tls" }, "data": { "ca.crt": "Y2VydA==" } }))?,
            obj(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "config" }, "data": { "release": release.name.as_str() } }))?,
            obj(json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "runtime" }, "spec": { "replicas": 1 } }))?,
            obj(json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "runtime" }, "rules": [] }))?,
        ];
        if values["extra"] == true {
            out.push(obj(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "extra" } }))?);
            out.push(obj(json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "extra" }, "rules": [] }))?);
        }
        Ok(out)
    }

    fn crds(&self) -> Result<Vec<DynamicObject>, TemplateError> {
        Ok(vec![obj(json!({
            "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": { "name": "widgets.example.dev" }, "spec": { "group": "example.dev" }
        }))?])
    }
}

#[derive(Default)]
struct StaticEngine {
    fail: bool,
    seen: Mutex<Vec<Option<Credentials>>>,
}

#[async_trait]
impl TemplateEngine for StaticEngine {
    fn default_ref(&self) -> TemplateRef { TemplateRef { name: "runtime".into(), ..TemplateRef::default() } }

    async fn load(&self, tref: &TemplateRef, credentials: Option<&Credentials>) -> Result<Arc<dyn Template>, TemplateError> {
        self.seen.lock().unwrap().push(credentials.cloned());
        if self.fail {
            return Err(TemplateError::Load { name: tref.name.clone(), reason: "repository unreachable".into() });
        }
        Ok(Arc::new(StaticTemplate))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    api: Arc<MemoryManagedApi<RuntimeInstance>>,
    events: Arc<RecordingPublisher>,
    engine: Arc<StaticEngine>,
    rec: Reconciler<RuntimeInstance>,
    _rx: mpsc::UnboundedReceiver<ReconcileKey>,
}

fn harness_with(engine: StaticEngine) -> Harness {
    let store = Arc::new(MemoryStore::with_defaults());
    store.allow_all();
    let api = Arc::new(MemoryManagedApi::<RuntimeInstance>::new(Some(store.clone())));
    let events = Arc::new(RecordingPublisher::new());
    let engine = Arc::new(engine);
    let (tx, rx) = mpsc::unbounded_channel();
    let subs = Arc::new(SubscriptionManager::new(store.clone(), tx));
    let orch = Arc::new(Orchestrator::new(store.clone(), subs, Arc::new(Collector::default()), events.clone(), FIELD_MANAGER));
    let rec = Reconciler::<RuntimeInstance>::new(OperatorConfig::default(), api.clone(), store.clone(), engine.clone())
        .with_action(TemplateAction)
        .with_action(ApplyCrdsAction::new(FIELD_MANAGER))
        .with_action(ApplyResourcesAction::new(orch))
        .with_action(ConditionsAction);
    Harness { store, api, events, engine, rec, _rx: rx }
}

fn harness() -> Harness { harness_with(StaticEngine::default()) }

fn instance(ns: &str, name: &str, values: Value) -> RuntimeInstance {
    let mut ri = RuntimeInstance::new(name, RuntimeInstanceSpec { template: None, values: Some(values) });
    ri.metadata.namespace = Some(ns.into());
    ri
}

fn key() -> ReconcileKey { ReconcileKey::new(NS, NAME) }

fn kind(g: &str, v: &str, k: &str) -> TypeKey { TypeKey::new(g, v, k) }

fn applies_of(store: &MemoryStore, k: &str) -> usize { store.count_calls(|c| matches!(c, Call::Apply { key, .. } if key.kind == k)) }

#[tokio::test]
async fn singleton_rule_rejects_other_names() {
    let h = harness();
    h.api.insert(instance(NS, "second", json!({})));
    h.api.insert(instance("default", NAME, json!({})));

    for k in [ReconcileKey::new(NS, "second"), ReconcileKey::new("default", NAME)] {
        assert_eq!(h.rec.reconcile(&k).await.unwrap(), Outcome::Done);
        let ri = h.api.stored(&k).unwrap();
        let st = ri.status.as_ref().unwrap();
        assert_eq!(st.phase, Some(Phase::Error));
        let c = st.condition(TYPE_RECONCILED).unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.reason, REASON_UNSUPPORTED_CONFIGURATION);
        assert!(c.message.contains("runtime-instance"), "{}", c.message);
        assert!(!ri.has_finalizer(keel_reconcile::FINALIZER));
    }
    assert_eq!(h.store.count_calls(|c| matches!(c, Call::Apply { .. })), 0);
    assert!(h.store.objects().is_empty());
}

#[tokio::test]
async fn rejected_status_keeps_conditions_sorted() {
    let h = harness();
    let k = ReconcileKey::new(NS, "second");
    let mut ri = instance(NS, "second", json!({}));
    ri.status_mut().set_condition(Condition::new("Synced", ConditionStatus::True, "Synced", "Synced"));
    h.api.insert(ri);

    h.rec.reconcile(&k).await.unwrap();
    let st = h.api.stored(&k).unwrap().status.unwrap();
    let types: Vec<_> = st.conditions.iter().map(|c| c.type_.as_str()).collect();
    assert_eq!(types, vec![TYPE_RECONCILED, "Synced"]);
}

#[tokio::test]
async fn first_deploy_applies_everything() {
    let h = harness();
    h.api.insert(instance(NS, NAME, json!({ "extra": true })));
    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Done);

    let ri = h.api.stored(&key()).unwrap();
    assert!(ri.has_finalizer(keel_reconcile::FINALIZER));
    let st = ri.status.clone().unwrap();
    assert_eq!(st.phase, Some(Phase::Ready));
    assert_eq!(st.observed_generation, 1);
    assert_eq!(st.template_identity.as_ref().map(|i| i.version.as_str()), Some("1.0.0"));
    let types: Vec<_> = st.conditions.iter().map(|c| c.type_.as_str()).collect();
    assert_eq!(types, vec![TYPE_READY, TYPE_RECONCILED]);
    let ready = st.condition(TYPE_READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.message, "0/1 deployments ready, statefulSets ready 0/0");

    assert_eq!(applies_of(&h.store, "Secret"), 1);
    assert_eq!(applies_of(&h.store, "CustomResourceDefinition"), 1);
    assert_eq!(h.store.names(&kind("", "v1", "ConfigMap")), vec!["config".to_string(), "extra".to_string()]);
    assert_eq!(h.store.names(&kind("rbac.authorization.k8s.io", "v1", "ClusterRole")), vec!["extra".to_string(), "runtime".to_string()]);
    assert_eq!(h.events.count(EVENT_RENDER_FULL_TEMPLATE), 1);
    // the collection pass ran and found nothing
    assert_eq!(h.store.count_calls(|c| matches!(c, Call::Discover(_))), 1);
    assert_eq!(h.store.count_calls(|c| matches!(c, Call::Delete { .. })), 0);
    assert_eq!(h.store.invalidations(), 1);
}

#[tokio::test]
async fn second_reconcile_skips_install_only_objects() {
    let h = harness();
    h.api.insert(instance(NS, NAME, json!({})));
    h.rec.reconcile(&key()).await.unwrap();
    h.store.clear_calls();

    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Done);
    assert_eq!(applies_of(&h.store, "Secret"), 0);
    assert_eq!(applies_of(&h.store, "CustomResourceDefinition"), 0);
    assert_eq!(applies_of(&h.store, "ConfigMap"), 1);
    assert_eq!(applies_of(&h.store, "Deployment"), 1);
    assert_eq!(h.store.count_calls(|c| matches!(c, Call::Discover(_))), 0);
    assert_eq!(h.events.count(EVENT_RENDER_FULL_TEMPLATE), 1);
}

#[tokio::test]
async fn workload_status_feeds_ready_condition() {
    let h = harness();
    h.api.insert(instance(NS, NAME, json!({})));
    h.rec.reconcile(&key()).await.unwrap();
    h.store
        .set_status(&kind("apps", "v1", "Deployment"), Some(NS), "runtime", json!({ "conditions": [ { "type": "Available", "status": "True" } ] }))
        .unwrap();

    h.rec.reconcile(&key()).await.unwrap();
    let st = h.api.stored(&key()).unwrap().status.unwrap();
    let ready = st.condition(TYPE_READY).unwrap();
    assert!(ready.is_true());
    assert_eq!(ready.message, "1/1 deployments ready, statefulSets ready 0/0");
}

#[tokio::test]
async fn spec_edit_collects_previous_generation() {
    let h = harness();
    h.api.insert(instance(NS, NAME, json!({ "extra": true })));
    h.rec.reconcile(&key()).await.unwrap();

    h.api.edit(&key(), |ri| ri.spec.values = Some(json!({})));
    h.store.clear_calls();
    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Done);

    assert_eq!(h.store.names(&kind("", "v1", "ConfigMap")), vec!["config".to_string()]);
    assert_eq!(h.store.names(&kind("rbac.authorization.k8s.io", "v1", "ClusterRole")), vec!["runtime".to_string()]);
    // CRDs have no version label and survive collection
    assert_eq!(h.store.names(&kind("apiextensions.k8s.io", "v1", "CustomResourceDefinition")), vec!["widgets.example.dev".to_string()]);
    assert_eq!(applies_of(&h.store, "Secret"), 1);
    assert_eq!(h.api.stored(&key()).unwrap().observed_generation(), 2);
    assert_eq!(h.events.count(EVENT_RENDER_FULL_TEMPLATE), 2);
}

#[tokio::test]
async fn deletion_runs_cleanup_and_releases_finalizer() {
    let h = harness();
    h.api.insert(instance(NS, NAME, json!({ "extra": true })));
    h.rec.reconcile(&key()).await.unwrap();

    h.api.mark_deleting(&key());
    assert!(h.api.stored(&key()).is_some());
    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Done);

    assert!(h.api.stored(&key()).is_none());
    assert!(h.store.names(&kind("rbac.authorization.k8s.io", "v1", "ClusterRole")).is_empty());
    // namespaced dependents follow their owner
    assert!(h.store.names(&kind("", "v1", "ConfigMap")).is_empty());
    assert!(h.store.names(&kind("", "v1", "Secret")).is_empty());
    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Done);
}

#[tokio::test]
async fn status_conflict_requeues() {
    let h = harness();
    h.api.insert(instance(NS, NAME, json!({})));
    h.rec.reconcile(&key()).await.unwrap();

    h.api.conflict_next_status_writes(1);
    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Requeue);
    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Done);
}

#[tokio::test]
async fn action_failures_mark_the_resource_failed() {
    let h = harness_with(StaticEngine { fail: true, ..StaticEngine::default() });
    h.api.insert(instance(NS, NAME, json!({})));
    let err = h.rec.reconcile(&key()).await.unwrap_err();
    match &err {
        ReconcileError::Actions(errs) => assert_eq!(errs.len(), 3),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.to_string().contains("repository unreachable"), "{}", err);

    let st = h.api.stored(&key()).unwrap().status.unwrap();
    assert_eq!(st.phase, Some(Phase::Error));
    assert_eq!(st.observed_generation, 0);
    assert_eq!(st.condition(TYPE_RECONCILED).unwrap().reason, REASON_FAILURE);
    assert!(h.store.objects().is_empty());
}

#[tokio::test]
async fn credentials_come_from_the_referenced_secret() {
    let h = harness();
    h.store
        .insert(
            serde_json::from_value(json!({
                "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": "repo-creds", "namespace": NS },
                "data": { "username": "a2VlbA==", "password": "czNjcjN0" }
            }))
            .unwrap(),
        )
        .unwrap();
    let mut ri = instance(NS, NAME, json!({}));
    ri.spec.template = Some(TemplateSpec { repo: "https://charts.example.org".into(), secret: "repo-creds".into(), ..TemplateSpec::default() });
    h.api.insert(ri);
    h.rec.reconcile(&key()).await.unwrap();

    let seen = h.engine.seen.lock().unwrap().clone();
    // loaded once per pass, shared by every action
    assert_eq!(seen.len(), 1);
    let creds = seen[0].clone().unwrap();
    assert_eq!(creds.username.as_deref(), Some("keel"));
    assert_eq!(creds.password.as_deref(), Some("s3cr3t"));
}

#[tokio::test]
async fn missing_credentials_secret_loads_anonymously() {
    let h = harness();
    let mut ri = instance(NS, NAME, json!({}));
    ri.spec.template = Some(TemplateSpec { secret: "absent".into(), ..TemplateSpec::default() });
    h.api.insert(ri);
    h.rec.reconcile(&key()).await.unwrap();
    assert_eq!(h.engine.seen.lock().unwrap().clone(), vec![None]);
}

struct Step {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Action<RuntimeInstance> for Step {
    fn name(&self) -> &'static str { self.name }

    async fn run(&self, _rr: &mut ReconciliationRequest<RuntimeInstance>) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("run {}", self.name));
        Ok(())
    }

    async fn cleanup(&self, _rr: &mut ReconciliationRequest<RuntimeInstance>) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("cleanup {}", self.name));
        Ok(())
    }
}

#[tokio::test]
async fn cleanup_runs_in_reverse_order() {
    let store = Arc::new(MemoryStore::with_defaults());
    let api = Arc::new(MemoryManagedApi::<RuntimeInstance>::new(Some(store.clone())));
    let log = Arc::new(Mutex::new(Vec::new()));
    let rec = Reconciler::<RuntimeInstance>::new(OperatorConfig::default(), api.clone(), store, Arc::new(StaticEngine::default()))
        .with_action(Step { name: "a", log: log.clone() })
        .with_action(Step { name: "b", log: log.clone() });
    assert_eq!(rec.action_names(), vec!["a", "b"]);

    api.insert(instance(NS, NAME, json!({})));
    rec.reconcile(&key()).await.unwrap();
    api.mark_deleting(&key());
    rec.reconcile(&key()).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["run a", "run b", "cleanup b", "cleanup a"]);
    assert!(api.stored(&key()).is_none());
}

#[tokio::test]
async fn missing_resource_is_done() {
    let h = harness();
    assert_eq!(h.rec.reconcile(&key()).await.unwrap(), Outcome::Done);
    assert_eq!(h.api.updates(), 0);
}
