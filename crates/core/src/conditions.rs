//! Status subresource model and condition bookkeeping.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::TemplateIdentity;

pub const TYPE_RECONCILED: &str = "Reconciled";
pub const TYPE_READY: &str = "Ready";

pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_FAILURE: &str = "Failure";
pub const REASON_UNSUPPORTED_CONFIGURATION: &str = "UnsupportedConfiguration";
pub const REASON_READY: &str = "Ready";
pub const REASON_IN_PROGRESS: &str = "InProgress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    Ready,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Ready => f.write_str("Ready"),
            Phase::Error => f.write_str("Error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
    /// RFC 3339; only moves when `status` flips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation: 0,
            last_transition_time: None,
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool { self.status == ConditionStatus::True }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_identity: Option<TemplateIdentity>,
}

impl ManagedStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find(&self.conditions, type_)
    }

    pub fn set_condition(&mut self, c: Condition) { set(&mut self.conditions, c) }

    /// Stable ordering by type so serialized status does not churn.
    pub fn sort_conditions(&mut self) {
        self.conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Upsert by type. The transition time is kept unless the status flips.
pub fn set(conditions: &mut Vec<Condition>, mut c: Condition) {
    let now = chrono::Utc::now().to_rfc3339();
    match conditions.iter_mut().find(|e| e.type_ == c.type_) {
        Some(existing) => {
            if existing.status != c.status || existing.last_transition_time.is_none() {
                existing.last_transition_time = Some(c.last_transition_time.take().unwrap_or(now));
            }
            existing.status = c.status;
            existing.reason = c.reason;
            existing.message = c.message;
            existing.observed_generation = c.observed_generation;
        }
        None => {
            if c.last_transition_time.is_none() { c.last_transition_time = Some(now); }
            conditions.push(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_upserts_by_type_and_keeps_transition_time() {
        let mut v = Vec::new();
        set(&mut v, Condition::new(TYPE_READY, ConditionStatus::False, REASON_IN_PROGRESS, "0/1"));
        let t0 = v[0].last_transition_time.clone();
        assert!(t0.is_some());

        let mut same = Condition::new(TYPE_READY, ConditionStatus::False, REASON_IN_PROGRESS, "0/2");
        same.last_transition_time = Some("ignored".into());
        set(&mut v, same);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].message, "0/2");
        assert_eq!(v[0].last_transition_time, t0);

        let mut flipped = Condition::new(TYPE_READY, ConditionStatus::True, REASON_READY, "1/1");
        flipped.last_transition_time = Some("2030-01-01T00:00:00Z".into());
        set(&mut v, flipped);
        assert!(v[0].is_true());
        assert_eq!(v[0].last_transition_time.as_deref(), Some("2030-01-01T00:00:00Z"));
    }

    #[test]
    fn sort_orders_by_type() {
        let mut s = ManagedStatus::default();
        s.set_condition(Condition::new(TYPE_RECONCILED, ConditionStatus::True, REASON_RECONCILED, ""));
        s.set_condition(Condition::new(TYPE_READY, ConditionStatus::True, REASON_READY, ""));
        s.sort_conditions();
        let types: Vec<_> = s.conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec![TYPE_READY, TYPE_RECONCILED]);
    }

    #[test]
    fn status_serializes_camel_case() {
        let s = ManagedStatus {
            phase: Some(Phase::Ready),
            conditions: vec![Condition::new(TYPE_READY, ConditionStatus::True, REASON_READY, "ok").with_generation(3)],
            observed_generation: 3,
            template_identity: Some(TemplateIdentity { name: "runtime".into(), source: "".into(), version: "1.2.0".into() }),
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["phase"], "Ready");
        assert_eq!(v["observedGeneration"], 3);
        assert_eq!(v["conditions"][0]["type"], "Ready");
        assert_eq!(v["conditions"][0]["observedGeneration"], 3);
        assert_eq!(v["templateIdentity"]["version"], "1.2.0");
    }
}
