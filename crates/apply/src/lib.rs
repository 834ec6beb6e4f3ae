//! Keel apply: template port, value merging and the render/apply orchestrator.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{Credentials, Release, TemplateIdentity, TemplateRef};
use kube::core::DynamicObject;
use serde_json::Value as Json;

pub mod manifest;
pub mod orchestrator;
pub mod values;

pub use manifest::parse_manifests;
pub use orchestrator::{force_reason, ApplyReport, Orchestrator, EVENT_RENDER_FULL_TEMPLATE};
pub use values::{default_customizers, default_overrides, merge_values, SidecarPullPolicy, ValuesCustomizer};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("cannot load template {name}: {reason}")]
    Load { name: String, reason: String },
    #[error("cannot render template: {0}")]
    Render(String),
    #[error("cannot decode manifest {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("manifest {origin}: {reason}")]
    Invalid { origin: String, reason: String },
}

/// A loaded template. Rendering is pure: same release and values, same objects.
pub trait Template: Send + Sync {
    fn identity(&self) -> TemplateIdentity;

    fn render(&self, release: &Release, values: &Json) -> Result<Vec<DynamicObject>, TemplateError>;

    /// CRDs shipped with the template, applied ahead of the rendered objects.
    fn crds(&self) -> Result<Vec<DynamicObject>, TemplateError>;
}

/// Loads templates by reference.
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    /// Reference used when the managed resource names none.
    fn default_ref(&self) -> TemplateRef;

    async fn load(&self, tref: &TemplateRef, credentials: Option<&Credentials>) -> Result<Arc<dyn Template>, TemplateError>;
}
