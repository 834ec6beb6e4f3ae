//! Equality/existence label selectors, rendered in the API server's syntax.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    Exists(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn eq(mut self, key: &str, value: impl Into<String>) -> Self {
        self.reqs.push(Requirement::Equals(key.to_string(), value.into()));
        self
    }

    pub fn exists(mut self, key: &str) -> Self {
        self.reqs.push(Requirement::Exists(key.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|r| match r {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .reqs
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::Exists(k) => k.clone(),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_server_syntax() {
        let s = LabelSelector::new().eq("app", "keel").exists("tier");
        assert_eq!(s.to_string(), "app=keel,tier");
    }

    #[test]
    fn matches_all_requirements() {
        let s = LabelSelector::new().eq("app", "keel").exists("gen");
        assert!(s.matches(&labels(&[("app", "keel"), ("gen", "2")])));
        assert!(!s.matches(&labels(&[("app", "keel")])));
        assert!(!s.matches(&labels(&[("app", "other"), ("gen", "2")])));
        assert!(LabelSelector::new().matches(&BTreeMap::new()));
    }
}
