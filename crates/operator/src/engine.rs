//! Template engine backed by a directory of plain manifests.
//!
//! Layout:
//!   template.yaml     name and version of the template
//!   *.yaml, *.yml     manifests, rendered in file name order
//!   crds/*.yaml       CRDs shipped with the template
//!
//! Manifests may reference `{{ .Release.Name }}`, `{{ .Release.Namespace }}`,
//! `{{ .Release.Revision }}` and `{{ .Values.<dotted.path> }}`. A template
//! without a version is loaded as `0.0.0`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use keel_apply::{parse_manifests, Template, TemplateEngine, TemplateError};
use keel_core::{labels, Credentials, Release, TemplateIdentity, TemplateRef};
use kube::core::DynamicObject;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

const META_FILE: &str = "template.yaml";
const CRDS_DIR: &str = "crds";

#[derive(Debug, Default, Deserialize)]
struct TemplateMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

pub struct ManifestEngine {
    dir: PathBuf,
}

impl ManifestEngine {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    fn resolve(&self, tref: &TemplateRef) -> Result<PathBuf, TemplateError> {
        let src = tref.source.trim();
        if src.is_empty() {
            return Ok(self.dir.clone());
        }
        match src.strip_prefix("file://") {
            Some(p) => Ok(PathBuf::from(p)),
            None if src.contains("://") => {
                Err(TemplateError::Load { name: tref.name.clone(), reason: format!("unsupported template source {}", src) })
            }
            None => Ok(PathBuf::from(src)),
        }
    }
}

#[async_trait]
impl TemplateEngine for ManifestEngine {
    fn default_ref(&self) -> TemplateRef {
        TemplateRef { name: dir_name(&self.dir), ..TemplateRef::default() }
    }

    async fn load(&self, tref: &TemplateRef, credentials: Option<&Credentials>) -> Result<Arc<dyn Template>, TemplateError> {
        let dir = self.resolve(tref)?;
        if credentials.is_some() {
            debug!(dir = %dir.display(), "credentials ignored for local templates");
        }
        let t = ManifestTemplate::read(&dir, &tref.source)?;
        if !tref.version.is_empty() && tref.version != t.identity.version {
            return Err(TemplateError::Load {
                name: t.identity.name.clone(),
                reason: format!("version {} requested, {} found in {}", tref.version, t.identity.version, dir.display()),
            });
        }
        info!(name = %t.identity.name, version = %t.identity.version, files = t.manifests.len(), crds = t.crds.len(), "template loaded");
        Ok(Arc::new(t))
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn load_err(dir: &Path, e: impl std::fmt::Display) -> TemplateError {
    TemplateError::Load { name: dir_name(dir), reason: e.to_string() }
}

/// `(file name, contents)` of every yaml file in `dir`, sorted by name.
fn read_yaml_files(dir: &Path) -> Result<Vec<(String, String)>, TemplateError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| load_err(dir, format!("{}: {}", dir.display(), e)))? {
        let path = entry.map_err(|e| load_err(dir, e))?.path();
        let is_yaml = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e == "yaml" || e == "yml");
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if !path.is_file() || !is_yaml || name == META_FILE {
            continue;
        }
        let text = std::fs::read_to_string(&path).map_err(|e| load_err(dir, format!("{}: {}", path.display(), e)))?;
        out.push((name, text));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

pub struct ManifestTemplate {
    identity: TemplateIdentity,
    manifests: Vec<(String, String)>,
    crds: Vec<(String, String)>,
}

impl ManifestTemplate {
    pub fn read(dir: &Path, source: &str) -> Result<Self, TemplateError> {
        let meta_path = dir.join(META_FILE);
        let meta: TemplateMeta = match std::fs::read_to_string(&meta_path) {
            Ok(text) => serde_yaml::from_str(&text).map_err(|source| TemplateError::Decode { origin: META_FILE.to_string(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TemplateMeta::default(),
            Err(e) => return Err(load_err(dir, format!("{}: {}", meta_path.display(), e))),
        };
        let version = if meta.version.trim().is_empty() {
            warn!(dir = %dir.display(), version = labels::UNVERSIONED, "template declares no version");
            labels::UNVERSIONED.to_string()
        } else {
            meta.version
        };
        let crds_dir = dir.join(CRDS_DIR);
        let crds = if crds_dir.is_dir() { read_yaml_files(&crds_dir)? } else { Vec::new() };
        let identity = TemplateIdentity {
            name: if meta.name.is_empty() { dir_name(dir) } else { meta.name },
            source: source.to_string(),
            version,
        };
        Ok(Self { identity, manifests: read_yaml_files(dir)?, crds })
    }
}

impl Template for ManifestTemplate {
    fn identity(&self) -> TemplateIdentity { self.identity.clone() }

    fn render(&self, release: &Release, values: &Json) -> Result<Vec<DynamicObject>, TemplateError> {
        let mut out = Vec::new();
        for (name, text) in &self.manifests {
            let text = substitute(name, text, release, values)?;
            out.extend(parse_manifests(name, &text)?);
        }
        Ok(out)
    }

    fn crds(&self) -> Result<Vec<DynamicObject>, TemplateError> {
        let mut out = Vec::new();
        for (name, text) in &self.crds {
            out.extend(parse_manifests(name, text)?);
        }
        Ok(out)
    }
}

/// Scalar at `path` (dot separated) in `values`, formatted for a manifest.
/// Strings are inserted bare, maps and lists as flow YAML.
fn lookup_value(values: &Json, path: &str) -> Option<String> {
    let mut cur = values;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    match cur {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        Json::Bool(_) | Json::Number(_) => Some(cur.to_string()),
        Json::Array(_) | Json::Object(_) => serde_json::to_string(cur).ok(),
    }
}

/// Replace `{{ .Release.* }}` and `{{ .Values.* }}` placeholders. Anything
/// else between braces, or a value path that resolves to nothing, is an error.
pub fn substitute(origin: &str, text: &str, release: &Release, values: &Json) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Render(format!("{}: unterminated placeholder", origin)))?;
        match after[..end].trim() {
            ".Release.Name" => out.push_str(&release.name),
            ".Release.Namespace" => out.push_str(&release.namespace),
            ".Release.Revision" => out.push_str(&release.revision.to_string()),
            expr if expr.starts_with(".Values.") => {
                let path = &expr[".Values.".len()..];
                let v = lookup_value(values, path)
                    .ok_or_else(|| TemplateError::Render(format!("{}: no value at {}", origin, path)))?;
                out.push_str(&v);
            }
            other => return Err(TemplateError::Render(format!("{}: unknown placeholder {{{{ {} }}}}", origin, other))),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_apply::{default_overrides, merge_values};
    use serde_json::json;

    fn release() -> Release { Release { name: "runtime-instance".into(), namespace: "keel-system".into(), revision: 3 } }

    fn write(dir: &Path, name: &str, text: &str) { std::fs::write(dir.join(name), text).unwrap(); }

    #[test]
    fn substitutes_release_placeholders() {
        let s = substitute("a.yaml", "ns: {{ .Release.Namespace }}\nname: {{.Release.Name}}-{{ .Release.Revision }}", &release(), &Json::Null)
            .unwrap();
        assert_eq!(s, "ns: keel-system\nname: runtime-instance-3");
        assert!(substitute("a.yaml", "{{ .Chart.Name }}", &release(), &Json::Null).is_err());
        assert!(substitute("a.yaml", "{{ .Release.Name", &release(), &Json::Null).is_err());
    }

    #[test]
    fn substitutes_value_paths() {
        let values = json!({ "sentry": { "replicas": 2, "image": "sentry:1.14", "ha": true, "args": ["--a", "--b"] }, "empty": null });
        let s = substitute(
            "a.yaml",
            "r: {{ .Values.sentry.replicas }}\ni: {{ .Values.sentry.image }}\nh: {{ .Values.sentry.ha }}\na: {{ .Values.sentry.args }}",
            &release(),
            &values,
        )
        .unwrap();
        assert_eq!(s, "r: 2\ni: sentry:1.14\nh: true\na: [\"--a\",\"--b\"]");
        assert!(substitute("a.yaml", "{{ .Values.sentry.missing }}", &release(), &values).is_err());
        assert!(substitute("a.yaml", "{{ .Values.empty }}", &release(), &values).is_err());
        assert!(substitute("a.yaml", "{{ .Values.sentry.replicas.deeper }}", &release(), &values).is_err());
    }

    #[tokio::test]
    async fn safety_overrides_reach_rendered_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "sentry.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: sentry\ndata:\n  runAsNonRoot: \"{{ .Values.sentry.runAsNonRoot }}\"\n  replicas: \"{{ .Values.sentry.replicas }}\"\n",
        );
        let engine = ManifestEngine::new(tmp.path());
        let t = engine.load(&engine.default_ref(), None).await.unwrap();
        assert_eq!(t.identity().version, labels::UNVERSIONED);

        let user = json!({ "sentry": { "runAsNonRoot": false, "replicas": 3 } });
        let values = merge_values(&user, &default_overrides());
        let objs = t.render(&release(), &values).unwrap();
        assert_eq!(objs[0].data["data"]["runAsNonRoot"], "true");
        assert_eq!(objs[0].data["data"]["replicas"], "3");
    }

    #[tokio::test]
    async fn loads_sorted_manifests_and_crds() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        write(dir, META_FILE, "name: runtime\nversion: 1.2.0\n");
        write(dir, "20-config.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ .Release.Name }}-config\n");
        write(dir, "10-sa.yml", "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: runtime\n---\n# nothing here\n");
        write(dir, "README.md", "not a manifest");
        std::fs::create_dir(dir.join(CRDS_DIR)).unwrap();
        write(
            &dir.join(CRDS_DIR),
            "widgets.yaml",
            "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.dev\n",
        );

        let engine = ManifestEngine::new(dir);
        let t = engine.load(&engine.default_ref(), None).await.unwrap();
        assert_eq!(t.identity().name, "runtime");
        assert_eq!(t.identity().version, "1.2.0");

        let objs = t.render(&release(), &Json::Null).unwrap();
        let names: Vec<_> = objs.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["runtime", "runtime-instance-config"]);
        assert_eq!(t.crds().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_version_mismatch_and_remote_sources() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), META_FILE, "name: runtime\nversion: 1.2.0\n");
        let engine = ManifestEngine::new(tmp.path());

        let wrong = TemplateRef { version: "1.3.0".into(), ..engine.default_ref() };
        assert!(matches!(engine.load(&wrong, None).await, Err(TemplateError::Load { .. })));

        let remote = TemplateRef { source: "https://charts.example.org".into(), ..engine.default_ref() };
        assert!(matches!(engine.load(&remote, None).await, Err(TemplateError::Load { .. })));

        let local = TemplateRef { source: format!("file://{}", tmp.path().display()), ..engine.default_ref() };
        let t = engine.load(&local, None).await.unwrap();
        assert!(t.identity().source.starts_with("file://"));
    }
}
