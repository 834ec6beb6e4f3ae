//! Per-pass context handed to every action.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keel_apply::{Template, TemplateEngine};
use keel_core::{Credentials, ManagedObject, TemplateIdentity, TemplateRef, TypeKey};
use keel_kubehub::ObjectStore;
use kube::core::DynamicObject;
use tracing::debug;

pub const CREDENTIALS_USERNAME_KEY: &str = "username";
pub const CREDENTIALS_PASSWORD_KEY: &str = "password";

pub struct ReconciliationRequest<K> {
    pub resource: K,
    pub store: Arc<dyn ObjectStore>,
    engine: Arc<dyn TemplateEngine>,
    template: Option<Arc<dyn Template>>,
    /// Template identity as recorded in status before this pass started.
    pub previous_identity: Option<TemplateIdentity>,
}

impl<K: ManagedObject> ReconciliationRequest<K> {
    pub fn new(resource: K, store: Arc<dyn ObjectStore>, engine: Arc<dyn TemplateEngine>) -> Self {
        let previous_identity = resource.status().and_then(|s| s.template_identity.clone());
        Self { resource, store, engine, template: None, previous_identity }
    }

    /// Reference to load: the engine default with any non-empty field from the resource on top.
    pub fn template_ref(&self) -> TemplateRef {
        let mut r = self.engine.default_ref();
        if let Some(spec) = self.resource.template_ref() {
            if !spec.name.is_empty() { r.name = spec.name; }
            if !spec.source.is_empty() { r.source = spec.source; }
            if !spec.version.is_empty() { r.version = spec.version; }
            r.credentials_ref = spec.credentials_ref;
        }
        r
    }

    /// The template handle, loaded on first use and reused for the rest of the pass.
    pub async fn template(&mut self) -> Result<Arc<dyn Template>> {
        if let Some(t) = &self.template {
            return Ok(t.clone());
        }
        let tref = self.template_ref();
        let creds = self.credentials(&tref).await?;
        let t = self.engine.load(&tref, creds.as_ref()).await.with_context(|| format!("cannot load template {}", tref.name))?;
        self.template = Some(t.clone());
        Ok(t)
    }

    /// Repository credentials from the referenced secret. A missing secret means anonymous access.
    async fn credentials(&self, tref: &TemplateRef) -> Result<Option<Credentials>> {
        let Some(secret) = tref.credentials_ref.as_deref() else { return Ok(None) };
        let ns = self.resource.key().namespace;
        let found = self
            .store
            .get(&TypeKey::new("", "v1", "Secret"), Some(&ns), secret)
            .await
            .with_context(|| format!("unable to fetch secret {}", secret))?;
        match found {
            Some(obj) => Ok(Some(Credentials {
                username: secret_value(&obj, CREDENTIALS_USERNAME_KEY)?,
                password: secret_value(&obj, CREDENTIALS_PASSWORD_KEY)?,
            })),
            None => {
                debug!(secret, "credentials secret not found, loading anonymously");
                Ok(None)
            }
        }
    }
}

fn secret_value(obj: &DynamicObject, key: &str) -> Result<Option<String>> {
    let Some(encoded) = obj.data.get("data").and_then(|d| d.get(key)).and_then(|v| v.as_str()) else { return Ok(None) };
    let raw = STANDARD.decode(encoded).with_context(|| format!("secret key {} is not valid base64", key))?;
    Ok(Some(String::from_utf8(raw).with_context(|| format!("secret key {} is not valid utf-8", key))?))
}
