//! Managed resources: `RuntimeInstance` and the `ControlPlane` that delegates to it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ManagedObject, ManagedStatus, TemplateRef};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.keel.dev",
    version = "v1alpha1",
    kind = "RuntimeInstance",
    namespaced,
    status = "ManagedStatus",
    shortname = "ri"
)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateSpec>,
    /// Template values, merged under the operator's safety overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Secret with `username`/`password` keys for the template repository.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
}

impl ManagedObject for RuntimeInstance {
    fn status(&self) -> Option<&ManagedStatus> { self.status.as_ref() }

    fn status_mut(&mut self) -> &mut ManagedStatus { self.status.get_or_insert_with(ManagedStatus::default) }

    fn values(&self) -> Option<&serde_json::Value> { self.spec.values.as_ref() }

    fn template_ref(&self) -> Option<TemplateRef> {
        self.spec.template.as_ref().map(|t| TemplateRef {
            name: t.name.clone(),
            source: t.repo.clone(),
            version: t.version.clone(),
            credentials_ref: if t.secret.is_empty() { None } else { Some(t.secret.clone()) },
        })
    }
}

/// Front door for cluster administrators. The operator turns it into the
/// singleton `RuntimeInstance` and mirrors that instance's status back.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.keel.dev",
    version = "v1alpha1",
    kind = "ControlPlane",
    namespaced,
    status = "ManagedStatus",
    shortname = "cp"
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Handed to the delegated instance unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

impl ManagedObject for ControlPlane {
    fn status(&self) -> Option<&ManagedStatus> { self.status.as_ref() }

    fn status_mut(&mut self) -> &mut ManagedStatus { self.status.get_or_insert_with(ManagedStatus::default) }

    fn values(&self) -> Option<&serde_json::Value> { self.spec.values.as_ref() }

    fn template_ref(&self) -> Option<TemplateRef> { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> RuntimeInstance {
        serde_json::from_str(json).expect("valid fixture")
    }

    #[test]
    fn template_ref_maps_secret_to_credentials_ref() {
        let ri = parse(r#"{
            "apiVersion": "operator.keel.dev/v1alpha1",
            "kind": "RuntimeInstance",
            "metadata": { "name": "runtime-instance", "namespace": "keel-system", "generation": 4 },
            "spec": { "template": { "repo": "https://charts.example.org", "name": "runtime", "version": "1.14.0", "secret": "repo-creds" },
                      "values": { "global": { "ha": { "enabled": true } } } }
        }"#);
        let tr = ri.template_ref().unwrap();
        assert_eq!(tr.source, "https://charts.example.org");
        assert_eq!(tr.credentials_ref.as_deref(), Some("repo-creds"));
        assert_eq!(ri.generation(), 4);
        assert_eq!(ri.observed_generation(), 0);
        assert_eq!(ri.values().unwrap()["global"]["ha"]["enabled"], true);
    }

    #[test]
    fn missing_template_selects_default() {
        let mut ri = RuntimeInstance::new("runtime-instance", RuntimeInstanceSpec::default());
        assert!(ri.template_ref().is_none());
        assert!(!ri.is_deleting());
        ri.status_mut().observed_generation = 2;
        assert_eq!(ri.observed_generation(), 2);
    }

    #[test]
    fn control_plane_carries_values_only() {
        let cp: ControlPlane = serde_json::from_value(serde_json::json!({
            "apiVersion": "operator.keel.dev/v1alpha1",
            "kind": "ControlPlane",
            "metadata": { "name": "control-plane", "namespace": "keel-system" },
            "spec": { "values": { "sentry": { "replicas": 2 } } }
        }))
        .expect("valid fixture");
        assert!(cp.template_ref().is_none());
        assert_eq!(cp.values().unwrap()["sentry"]["replicas"], 2);
        assert_eq!(cp.key().to_string(), "keel-system/control-plane");
    }
}
