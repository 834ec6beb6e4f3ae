//! Template values: user input merged under fixed safety overrides, then
//! passed through the customizers.

use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::TemplateError;

/// Sub-components forced to run as non-root whatever the user asks for.
pub const HARDENED_COMPONENTS: &[&str] = &["operator", "placement", "sentry", "dashboard", "sidecar_injector"];

pub fn default_overrides() -> Json {
    let mut m = serde_json::Map::new();
    for c in HARDENED_COMPONENTS {
        m.insert((*c).to_string(), json!({ "runAsNonRoot": true }));
    }
    Json::Object(m)
}

pub const SIDECAR_INJECTOR: &str = "sidecar_injector";
pub const SIDECAR_PULL_POLICY: &str = "sidecarImagePullPolicy";

/// Rewrites the merged values right before rendering.
pub trait ValuesCustomizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn customize(&self, values: Json) -> Result<Json, TemplateError>;
}

/// A custom sidecar image is pulled on every start unless the user picked a
/// pull policy.
#[derive(Debug, Default)]
pub struct SidecarPullPolicy;

impl ValuesCustomizer for SidecarPullPolicy {
    fn name(&self) -> &'static str { "sidecar-pull-policy" }

    fn customize(&self, mut values: Json) -> Result<Json, TemplateError> {
        if let Some(injector) = values.get_mut(SIDECAR_INJECTOR).and_then(|v| v.as_object_mut()) {
            let named = injector.get("image").and_then(|i| i.as_object()).is_some_and(|i| i.contains_key("name"));
            if named && !injector.contains_key(SIDECAR_PULL_POLICY) {
                injector.insert(SIDECAR_PULL_POLICY.to_string(), json!("Always"));
            }
        }
        Ok(values)
    }
}

pub fn default_customizers() -> Vec<Arc<dyn ValuesCustomizer>> { vec![Arc::new(SidecarPullPolicy)] }

/// Deep merge: objects merge key by key, anything else in `top` replaces `base`.
pub fn merge_values(base: &Json, top: &Json) -> Json {
    match (base, top) {
        (Json::Object(b), Json::Object(t)) => {
            let mut out = b.clone();
            for (k, tv) in t {
                let merged = match out.get(k) {
                    Some(bv) => merge_values(bv, tv),
                    None => tv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Json::Object(out)
        }
        (_, Json::Null) => base.clone(),
        (_, t) => t.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_and_siblings_survive() {
        let user = json!({ "sentry": { "runAsNonRoot": false, "replicas": 3 }, "global": { "ha": true } });
        let v = merge_values(&user, &default_overrides());
        assert_eq!(v["sentry"]["runAsNonRoot"], true);
        assert_eq!(v["sentry"]["replicas"], 3);
        assert_eq!(v["global"]["ha"], true);
        assert_eq!(v["dashboard"]["runAsNonRoot"], true);
    }

    #[test]
    fn null_top_keeps_base() {
        assert_eq!(merge_values(&json!({ "a": 1 }), &Json::Null), json!({ "a": 1 }));
        assert_eq!(merge_values(&Json::Null, &json!({ "a": 1 })), json!({ "a": 1 }));
        assert_eq!(merge_values(&json!([1, 2]), &json!([3])), json!([3]));
    }

    #[test]
    fn custom_sidecar_image_gets_pulled_always() {
        let c = SidecarPullPolicy;
        let v = c.customize(json!({ "sidecar_injector": { "image": { "name": "registry.local/sidecar:dev" } } })).unwrap();
        assert_eq!(v["sidecar_injector"][SIDECAR_PULL_POLICY], "Always");

        let v = c.customize(json!({ "sidecar_injector": { "image": { "name": "x" }, "sidecarImagePullPolicy": "IfNotPresent" } })).unwrap();
        assert_eq!(v["sidecar_injector"][SIDECAR_PULL_POLICY], "IfNotPresent");

        let v = c.customize(json!({ "sidecar_injector": { "runAsNonRoot": true } })).unwrap();
        assert!(v["sidecar_injector"].get(SIDECAR_PULL_POLICY).is_none());
        assert_eq!(c.customize(Json::Null).unwrap(), Json::Null);
    }
}
