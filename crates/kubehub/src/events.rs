//! Kubernetes Event recording on the managed resource.
//!
//! Publishing is fire-and-forget: failures are logged and never fail a reconcile.

#[cfg(any(test, feature = "testing"))]
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>);
}

pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let event = Event { type_, reason: reason.to_string(), note, action: action.to_string(), secondary: None };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, action, error = %e, "event publish failed");
        }
    }
}

pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _regarding: &ObjectReference, _type_: EventType, _reason: &str, _action: &str, _note: Option<String>) {}
}

#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub regarding: String,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Keeps every published event in memory; used by tests.
#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingPublisher {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let ev = RecordedEvent {
            regarding: format!("{}/{}", regarding.namespace.as_deref().unwrap_or(""), regarding.name.as_deref().unwrap_or("")),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        };
        if let Ok(mut v) = self.events.lock() {
            v.push(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_publisher_keeps_events_in_order() {
        let p = RecordingPublisher::new();
        let r = ObjectReference { name: Some("runtime-instance".into()), namespace: Some("keel-system".into()), ..Default::default() };
        p.publish(&r, EventType::Normal, "RenderFullTemplate", "Reconcile", Some("generation 2".into())).await;
        p.publish(&r, EventType::Warning, "ApplyFailed", "Reconcile", None).await;
        let evs = p.events();
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0].regarding, "keel-system/runtime-instance");
        assert!(!evs[0].warning);
        assert!(evs[1].warning);
        assert_eq!(p.count("RenderFullTemplate"), 1);
    }
}
