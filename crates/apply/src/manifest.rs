//! Multi-document YAML to weakly-typed objects.

use kube::core::DynamicObject;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::TemplateError;

fn max_manifest_bytes() -> usize {
    std::env::var("KEEL_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4_000_000)
}

/// Parse every document in `text`. Empty documents and documents without a
/// `kind` (template leftovers such as comment-only files) are skipped.
pub fn parse_manifests(origin: &str, text: &str) -> Result<Vec<DynamicObject>, TemplateError> {
    if text.len() > max_manifest_bytes() {
        return Err(TemplateError::Invalid { origin: origin.to_string(), reason: format!("larger than {} bytes", max_manifest_bytes()) });
    }
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let val = serde_yaml::Value::deserialize(doc).map_err(|source| TemplateError::Decode { origin: origin.to_string(), source })?;
        if val.is_null() { continue; }
        let json: Json = serde_json::to_value(&val)
            .map_err(|e| TemplateError::Invalid { origin: origin.to_string(), reason: e.to_string() })?;
        let has_kind = json.get("kind").and_then(|k| k.as_str()).is_some_and(|k| !k.is_empty());
        if !has_kind { continue; }
        if json.get("apiVersion").and_then(|v| v.as_str()).is_none() {
            return Err(TemplateError::Invalid { origin: origin.to_string(), reason: "missing apiVersion".into() });
        }
        let obj: DynamicObject = serde_json::from_value(json)
            .map_err(|e| TemplateError::Invalid { origin: origin.to_string(), reason: e.to_string() })?;
        if obj.metadata.name.as_deref().unwrap_or("").is_empty() {
            return Err(TemplateError::Invalid { origin: origin.to_string(), reason: "missing metadata.name".into() });
        }
        out.push(obj);
    }
    Ok(out)
}
