//! Keel core types shared by every engine crate.
//!
//! Holds the identity types (`TypeKey`, `ReconcileKey`), the release label
//! vocabulary stamped on generated objects, the template reference/identity
//! pair and the `ManagedObject` capability trait the state machine drives.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod crd;

pub use conditions::{Condition, ConditionStatus, ManagedStatus, Phase};
pub use crd::{ControlPlane, ControlPlaneSpec, RuntimeInstance, RuntimeInstanceSpec, TemplateSpec};

/// Label keys stamped on every generated object.
pub mod labels {
    pub const RELEASE_NAME: &str = "operator.keel.dev/release.name";
    pub const RELEASE_NAMESPACE: &str = "operator.keel.dev/release.namespace";
    pub const RELEASE_VERSION: &str = "operator.keel.dev/release.version";
    pub const RELEASE_GENERATION: &str = "operator.keel.dev/release.generation";

    /// Version label value for templates that declare no version.
    pub const UNVERSIONED: &str = "0.0.0";
}

/// Kinds with special handling in the apply and watch paths.
pub mod kinds {
    use super::TypeKey;

    /// Applied only on a forced pass or when absent; externally mutated after install.
    pub const INSTALL_ONLY: &[(&str, &str, &str)] = &[
        ("", "v1", "Secret"),
        ("admissionregistration.k8s.io", "v1", "MutatingWebhookConfiguration"),
        ("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
    ];

    /// Kinds whose status feeds readiness and must take part in change detection.
    pub const STATUS_BEARING: &[(&str, &str, &str)] = &[("apps", "v1", "Deployment")];

    pub fn is_install_only(key: &TypeKey) -> bool { INSTALL_ONLY.iter().any(|(g, v, k)| key.is(g, v, k)) }

    pub fn is_status_bearing(key: &TypeKey) -> bool { STATUS_BEARING.iter().any(|(g, v, k)| key.is(g, v, k)) }
}

/// Group/version/kind of an object type, keyed the way subscriptions and the
/// collector index types (`apiVersion:kind`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an `apiVersion` string (`v1` or `group/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Type of a weakly-typed object; `None` when the type meta is missing.
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        let tm = obj.types.as_ref()?;
        if tm.kind.is_empty() || tm.api_version.is_empty() { return None; }
        Some(Self::from_api_version(&tm.api_version, &tm.kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn is(&self, group: &str, version: &str, kind: &str) -> bool {
        self.group == group && self.version == version && self.kind == kind
    }

    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.api_version(), self.kind)
    }
}

/// Key the dispatcher serializes reconciles on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Release coordinates handed to the template engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub revision: i64,
}

/// Where a template comes from. An empty `source` means the embedded default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    pub source: String,
    pub version: String,
    /// Name of a secret in the managed resource namespace holding repository credentials.
    pub credentials_ref: Option<String>,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Identity of a loaded template, compared across reconciles to detect changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TemplateIdentity {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl TemplateIdentity {
    /// Value stamped into the release version label. Never empty: an empty
    /// label reads as unlabelled and would keep the object out of collection.
    pub fn release_version(&self) -> &str {
        if self.version.trim().is_empty() { labels::UNVERSIONED } else { &self.version }
    }
}

/// Capabilities the reconciliation state machine needs from a managed resource type.
pub trait ManagedObject:
    kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn key(&self) -> ReconcileKey {
        let meta = self.meta();
        ReconcileKey::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
    }

    fn generation(&self) -> i64 { self.meta().generation.unwrap_or(0) }

    fn is_deleting(&self) -> bool { self.meta().deletion_timestamp.is_some() }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.meta().finalizers.as_deref().unwrap_or(&[]).iter().any(|f| f == finalizer)
    }

    fn status(&self) -> Option<&ManagedStatus>;

    fn status_mut(&mut self) -> &mut ManagedStatus;

    /// User-supplied template values (opaque JSON).
    fn values(&self) -> Option<&serde_json::Value>;

    /// Explicit template reference; `None` selects the operator default.
    fn template_ref(&self) -> Option<TemplateRef>;

    fn observed_generation(&self) -> i64 {
        self.status().map(|s| s.observed_generation).unwrap_or(0)
    }
}
