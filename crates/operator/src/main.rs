use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use keel_apply::Orchestrator;
use keel_core::{ControlPlane, RuntimeInstance, TypeKey};
use keel_gc::{Collector, GcConfig};
use keel_kubehub::{KubeEventPublisher, KubeManagedApi, KubeStore, ObjectStore, TypeRegistry};
use keel_reconcile::{
    instance_type, ApplyCrdsAction, ApplyResourcesAction, ConditionsAction, DelegateAction, MirrorStatusAction, OperatorConfig,
    Reconciler, TemplateAction, NAMESPACE_ENV,
};
use keel_watch::{Routing, SubscriptionManager};
use kube::Resource;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

mod dispatch;
mod engine;

use dispatch::Dispatcher;
use engine::ManifestEngine;

#[derive(Parser, Debug)]
#[command(name = "keel-operator", version, about = "Keel operator")]
struct Cli {
    /// Directory holding the default template
    #[arg(long = "manifests-dir", env = "KEEL_MANIFESTS_DIR", default_value = "/etc/keel/manifests")]
    manifests_dir: PathBuf,

    /// Namespace the managed singleton must live in
    #[arg(long = "namespace", env = NAMESPACE_ENV)]
    namespace: Option<String>,

    /// Minimum seconds between garbage collector discovery refreshes
    #[arg(long = "gc-interval-secs", default_value_t = 60)]
    gc_interval_secs: u64,

    /// Delay before retrying after a write conflict
    #[arg(long = "requeue-secs", default_value_t = 5)]
    requeue_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = OperatorConfig::from_env();
    if let Some(ns) = cli.namespace.filter(|s| !s.is_empty()) {
        cfg = cfg.with_namespace(ns);
    }
    info!(name = %cfg.name, namespace = %cfg.namespace, manifests = %cli.manifests_dir.display(), "starting");

    let client = kube::Client::try_default().await.context("cannot create kubernetes client")?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone(), Arc::new(TypeRegistry::new())));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), &cfg.field_manager));
    let api = Arc::new(KubeManagedApi::<RuntimeInstance>::new(client.clone()));
    let cp_api = Arc::new(KubeManagedApi::<ControlPlane>::new(client));

    let (tx, rx) = mpsc::unbounded_channel();
    let subs = Arc::new(SubscriptionManager::new(store.clone(), tx.clone()));
    subs.ensure_watch(&instance_type(), Routing::Own).await.context("cannot watch managed resources")?;

    // control planes have their own queue; instance changes are routed back to the owner
    let (cp_tx, cp_rx) = mpsc::unbounded_channel();
    let cp_subs = SubscriptionManager::new(store.clone(), cp_tx.clone());
    let control_planes = TypeKey::new(ControlPlane::group(&()), ControlPlane::version(&()), ControlPlane::kind(&()));
    cp_subs.ensure_watch(&control_planes, Routing::Own).await.context("cannot watch control planes")?;
    let delegated =
        Routing::Delegated { api_version: ControlPlane::api_version(&()).to_string(), kind: ControlPlane::kind(&()).to_string() };
    cp_subs.ensure_watch(&instance_type(), delegated).await.context("cannot watch delegated instances")?;

    let gc = Arc::new(Collector::new(GcConfig { refresh_interval: Duration::from_secs(cli.gc_interval_secs), ..GcConfig::default() }));
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), subs, gc, events, cfg.field_manager.clone()));
    let engine = Arc::new(ManifestEngine::new(cli.manifests_dir));
    let field_manager = cfg.field_manager.clone();

    let control_plane = Arc::new(
        Reconciler::<ControlPlane>::new(cfg.control_plane(), cp_api, store.clone(), engine.clone())
            .with_action(DelegateAction::new(cfg.name.clone(), field_manager.clone()))
            .with_action(MirrorStatusAction::new(cfg.name.clone())),
    );
    let reconciler = Arc::new(
        Reconciler::<RuntimeInstance>::new(cfg, api, store, engine)
            .with_action(TemplateAction)
            .with_action(ApplyCrdsAction::new(field_manager))
            .with_action(ApplyResourcesAction::new(orchestrator))
            .with_action(ConditionsAction),
    );
    info!(actions = ?reconciler.action_names(), control_plane = ?control_plane.action_names(), "reconcilers ready");

    let requeue = Duration::from_secs(cli.requeue_secs);
    let dispatcher = Dispatcher::new(rx, tx, requeue);
    let cp_dispatcher = Dispatcher::new(cp_rx, cp_tx, requeue);
    tokio::select! {
        _ = dispatcher.run(move |key| {
            let r = reconciler.clone();
            async move { r.reconcile(&key).await }
        }) => {}
        _ = cp_dispatcher.run(move |key| {
            let r = control_plane.clone();
            async move { r.reconcile(&key).await }
        }) => {}
        _ = signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
