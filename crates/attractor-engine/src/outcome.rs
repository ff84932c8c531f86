use crate::failure::FailureClass;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const META_FAILURE_CLASS: &str = "failure_class";
pub const META_FAILURE_SIGNATURE: &str = "failure_signature";
pub const META_FAILURE_CODE: &str = "failure_code";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Skipped,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Retry => "retry",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "retry" => Some(Self::Retry),
            "fail" => Some(Self::Fail),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }

    pub fn is_failure_like(self) -> bool {
        matches!(self, Self::Fail | Self::Retry)
    }
}

/// Canonical result of a single stage attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_updates: BTreeMap<String, Value>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: OutcomeStatus::Success,
            failure_reason: None,
            preferred_label: None,
            meta: BTreeMap::new(),
            context_updates: BTreeMap::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            ..Self::success()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Fail,
            failure_reason: Some(reason.into()),
            ..Self::success()
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Retry,
            failure_reason: Some(reason.into()),
            ..Self::success()
        }
    }

    pub fn with_class(mut self, class: FailureClass) -> Self {
        self.meta.insert(
            META_FAILURE_CLASS.to_string(),
            Value::String(class.as_str().to_string()),
        );
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.meta.insert(
            META_FAILURE_SIGNATURE.to_string(),
            Value::String(signature.into()),
        );
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.meta
            .insert(META_FAILURE_CODE.to_string(), Value::String(code.into()));
        self
    }

    pub fn with_preferred_label(mut self, label: impl Into<String>) -> Self {
        self.preferred_label = Some(label.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn failure_class(&self) -> FailureClass {
        FailureClass::normalize(self.meta_str(META_FAILURE_CLASS))
    }

    pub fn failure_code(&self) -> Option<&str> {
        self.meta_str(META_FAILURE_CODE)
    }

    /// Enforces the outcome invariants before the engine routes on it:
    /// fail/retry always carry a non-empty failure reason, and anything else
    /// never does.
    pub fn normalized(mut self) -> Self {
        if self.status.is_failure_like() {
            let empty = self
                .failure_reason
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty();
            if empty {
                self.failure_reason = Some("unspecified failure".to_string());
            }
        } else {
            self.failure_reason = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_status_parse_expected_case_insensitive() {
        assert_eq!(OutcomeStatus::parse(" Fail "), Some(OutcomeStatus::Fail));
        assert_eq!(
            OutcomeStatus::parse("PARTIAL_SUCCESS"),
            Some(OutcomeStatus::PartialSuccess)
        );
        assert_eq!(OutcomeStatus::parse("bogus"), None);
    }

    #[test]
    fn normalized_fail_without_reason_expected_placeholder() {
        let mut outcome = Outcome::success();
        outcome.status = OutcomeStatus::Fail;
        let normalized = outcome.normalized();
        assert_eq!(normalized.failure_reason.as_deref(), Some("unspecified failure"));
    }

    #[test]
    fn normalized_success_with_stale_reason_expected_cleared() {
        let mut outcome = Outcome::fail("boom");
        outcome.status = OutcomeStatus::Success;
        assert_eq!(outcome.normalized().failure_reason, None);
    }

    #[test]
    fn failure_class_missing_meta_expected_deterministic() {
        let outcome = Outcome::fail("boom");
        assert_eq!(outcome.failure_class(), FailureClass::Deterministic);
    }
}
