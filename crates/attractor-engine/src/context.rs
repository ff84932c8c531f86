use crate::failure::{failure_signature, FailureClass};
use crate::outcome::Outcome;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub type ContextValues = BTreeMap<String, Value>;

/// Mutable run context with last-writer-wins semantics, readable by edge
/// conditions. Clones share state; `clone_isolated` forks an independent
/// copy for branch engines.
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<ContextValues>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: ContextValues) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut values = self.inner.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let values = self.inner.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    pub fn apply_updates(&self, updates: &ContextValues) {
        if updates.is_empty() {
            return;
        }
        let mut values = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (key, value) in updates {
            values.insert(key.clone(), value.clone());
        }
    }

    /// Applies a completed node's outcome: its context updates plus the
    /// built-in routing keys.
    pub fn apply_outcome(&self, node_id: &str, outcome: &Outcome) {
        self.apply_updates(&outcome.context_updates);
        self.set(
            "outcome",
            Value::String(outcome.status.as_str().to_string()),
        );
        self.set(
            "failure_class",
            Value::String(outcome.failure_class().as_str().to_string()),
        );
        match outcome.failure_reason.as_deref() {
            Some(reason) => self.set("failure_reason", Value::String(reason.to_string())),
            None => self.set("failure_reason", Value::String(String::new())),
        }
        match outcome.preferred_label.as_deref() {
            Some(label) => self.set("preferred_label", Value::String(label.to_string())),
            None => self.set("preferred_label", Value::String(String::new())),
        }
        if outcome.status.is_failure_like() {
            self.set(
                "failure_signature",
                Value::String(failure_signature(node_id, outcome)),
            );
        }
    }

    pub fn snapshot(&self) -> ContextValues {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clone_isolated(&self) -> Self {
        Self::from_values(self.snapshot())
    }

    pub fn last_failure_class(&self) -> FailureClass {
        let raw = self.get("failure_class");
        FailureClass::normalize(raw.as_ref().and_then(Value::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_outcome_sets_builtin_keys() {
        let store = ContextStore::new();
        let outcome = Outcome::fail("contract mismatch").with_preferred_label("retry");
        store.apply_outcome("impl", &outcome);

        assert_eq!(store.get("outcome"), Some(json!("fail")));
        assert_eq!(store.get("failure_class"), Some(json!("deterministic")));
        assert_eq!(store.get("failure_reason"), Some(json!("contract mismatch")));
        assert_eq!(store.get("preferred_label"), Some(json!("retry")));
        assert!(store.get("failure_signature").is_some());
    }

    #[test]
    fn apply_outcome_success_clears_reason_and_label() {
        let store = ContextStore::new();
        store.apply_outcome("a", &Outcome::fail("boom"));
        store.apply_outcome("b", &Outcome::success());

        assert_eq!(store.get("outcome"), Some(json!("success")));
        assert_eq!(store.get("failure_reason"), Some(json!("")));
    }

    #[test]
    fn clone_isolated_expected_independent_copy() {
        let original = ContextStore::new();
        original.set("k", json!("original"));

        let forked = original.clone_isolated();
        forked.set("k", json!("fork"));

        assert_eq!(original.get("k"), Some(json!("original")));
        assert_eq!(forked.get("k"), Some(json!("fork")));
    }

    #[test]
    fn apply_updates_last_writer_wins() {
        let store = ContextStore::new();
        store.apply_updates(&BTreeMap::from([("k".to_string(), json!(1))]));
        store.apply_updates(&BTreeMap::from([("k".to_string(), json!(2))]));
        assert_eq!(store.get("k"), Some(json!(2)));
    }
}
