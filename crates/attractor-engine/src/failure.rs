use crate::outcome::{Outcome, META_FAILURE_SIGNATURE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Failure policy label. The set is closed; anything unrecognized is treated
/// as deterministic so unknown failures never retry (fail-closed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientInfra,
    Deterministic,
    Canceled,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientInfra => "transient_infra",
            Self::Deterministic => "deterministic",
            Self::Canceled => "canceled",
        }
    }

    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(str::trim).unwrap_or_default() {
            "transient_infra" => Self::TransientInfra,
            "canceled" => Self::Canceled,
            _ => Self::Deterministic,
        }
    }
}

/// Stable key for the restart/cycle circuit breakers. Prefers the
/// outcome-supplied signature hint; otherwise hashes the node id, the
/// normalized class, and the lowercased reason.
pub fn failure_signature(node_id: &str, outcome: &Outcome) -> String {
    if let Some(hint) = outcome
        .meta_str(META_FAILURE_SIGNATURE)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return hint.to_string();
    }

    let class = outcome.failure_class();
    let reason = outcome
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let mut hasher = DefaultHasher::new();
    (node_id, class.as_str(), reason.as_str()).hash(&mut hasher);
    format!("{}|{}|{:016x}", node_id, class.as_str(), hasher.finish())
}

/// Retry gate predicate: only failure-like outcomes in the transient class
/// are eligible for another attempt.
pub fn should_retry_outcome(outcome: &Outcome) -> bool {
    outcome.status.is_failure_like() && outcome.failure_class() == FailureClass::TransientInfra
}

/// Classifier verdict for a failed subprocess or provider call.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub class: FailureClass,
    pub signature: String,
    pub reason: String,
    pub code: Option<String>,
    /// Whether the run's provider failover chain may be consulted.
    pub failover_eligible: bool,
}

pub const CODE_TURN_BUDGET_EXHAUSTED: &str = "turn_budget_exhausted";
pub const CODE_QUOTA_EXCEEDED: &str = "quota_exceeded";
pub const CODE_CONTENT_FILTER: &str = "content_filter";

fn transient_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(timed? ?out|connection (reset|refused|closed)|temporar(y|ily) unavailab|rate.?limit|too many requests|\b429\b|\b5\d\d\b|server error|service unavailable|upstream|EOF)",
        )
        .expect("transient marker regex should compile")
    })
}

fn quota_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(quota (exceeded|exhausted)|insufficient[_ ]quota|billing|credit balance)")
            .expect("quota marker regex should compile")
    })
}

fn content_filter_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(content[_ ]filter|safety (filter|block)|blocked by (policy|moderation))")
            .expect("content filter marker regex should compile")
    })
}

fn contract_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(unknown (flag|option|argument|command)|unrecognized (flag|option|argument)|invalid (flag|option|argument)|model .{0,60}(not found|does not exist)|no such model|unsupported model|usage:)",
        )
        .expect("contract marker regex should compile")
    })
}

/// Map a failed provider invocation to a failure class, signature, and
/// reason. Rules are evaluated in order: provider-deterministic contract
/// markers first, then generic transient markers, then the deterministic
/// fallback. The verdict is a pure function of the inputs.
pub fn classify_provider_failure(
    provider: &str,
    stderr: &str,
    process_error: Option<&str>,
) -> Classification {
    let haystack = format!("{}\n{}", stderr, process_error.unwrap_or_default());
    let first_line = haystack
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("provider invocation failed")
        .to_string();

    if content_filter_markers().is_match(&haystack) {
        return Classification {
            class: FailureClass::Deterministic,
            signature: format!("content_filter|{provider}"),
            reason: first_line,
            code: Some(CODE_CONTENT_FILTER.to_string()),
            failover_eligible: false,
        };
    }

    if quota_markers().is_match(&haystack) {
        return Classification {
            class: FailureClass::Deterministic,
            signature: format!("quota_exceeded|{provider}"),
            reason: first_line,
            code: Some(CODE_QUOTA_EXCEEDED.to_string()),
            failover_eligible: true,
        };
    }

    if contract_markers().is_match(&haystack) {
        return Classification {
            class: FailureClass::Deterministic,
            signature: format!("cli_contract|{provider}"),
            reason: first_line,
            code: None,
            failover_eligible: false,
        };
    }

    if transient_markers().is_match(&haystack) {
        return Classification {
            class: FailureClass::TransientInfra,
            signature: format!("provider_transient|{provider}"),
            reason: first_line,
            code: None,
            failover_eligible: false,
        };
    }

    Classification {
        class: FailureClass::Deterministic,
        signature: format!("provider_failed|{provider}"),
        reason: first_line,
        code: None,
        failover_eligible: false,
    }
}

/// Deterministic outcome for an agent loop that ran out of turns after all
/// permitted budget extensions.
pub fn turn_budget_exhausted_outcome(provider: &str, max_turns: u32) -> Outcome {
    Outcome::retry(format!(
        "agent loop exhausted its turn budget ({max_turns} turns)"
    ))
    .with_class(FailureClass::Deterministic)
    .with_code(CODE_TURN_BUDGET_EXHAUSTED)
    .with_signature(format!("agent_turn_limit|{provider}|exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OutcomeStatus;

    #[test]
    fn normalize_unknown_class_expected_deterministic() {
        assert_eq!(FailureClass::normalize(None), FailureClass::Deterministic);
        assert_eq!(
            FailureClass::normalize(Some("wobbly")),
            FailureClass::Deterministic
        );
        assert_eq!(
            FailureClass::normalize(Some("transient_infra")),
            FailureClass::TransientInfra
        );
        assert_eq!(
            FailureClass::normalize(Some("canceled")),
            FailureClass::Canceled
        );
    }

    #[test]
    fn should_retry_outcome_gates_on_class_and_status() {
        let transient = Outcome::fail("conn reset").with_class(FailureClass::TransientInfra);
        assert!(should_retry_outcome(&transient));

        let deterministic = Outcome::fail("contract mismatch");
        assert!(!should_retry_outcome(&deterministic));

        let mut success = Outcome::success().with_class(FailureClass::TransientInfra);
        success.status = OutcomeStatus::Success;
        assert!(!should_retry_outcome(&success));
    }

    #[test]
    fn failure_signature_prefers_outcome_hint() {
        let outcome = Outcome::fail("x").with_signature("custom|sig");
        assert_eq!(failure_signature("n1", &outcome), "custom|sig");
    }

    #[test]
    fn failure_signature_is_stable_and_case_normalized() {
        let a = Outcome::fail("Connection Reset");
        let b = Outcome::fail("connection reset");
        assert_eq!(failure_signature("n1", &a), failure_signature("n1", &b));
        assert_ne!(failure_signature("n1", &a), failure_signature("n2", &a));
    }

    #[test]
    fn classify_timeout_expected_transient() {
        let verdict = classify_provider_failure("anthropic", "request timed out after 60s", None);
        assert_eq!(verdict.class, FailureClass::TransientInfra);
        assert_eq!(verdict.signature, "provider_transient|anthropic");
        assert!(!verdict.failover_eligible);
    }

    #[test]
    fn classify_429_expected_transient() {
        let verdict = classify_provider_failure("openai", "HTTP 429 too many requests", None);
        assert_eq!(verdict.class, FailureClass::TransientInfra);
    }

    #[test]
    fn classify_unknown_flag_expected_deterministic_contract() {
        let verdict =
            classify_provider_failure("google", "error: unknown flag '--approval-mode'", None);
        assert_eq!(verdict.class, FailureClass::Deterministic);
        assert_eq!(verdict.signature, "cli_contract|google");
    }

    #[test]
    fn classify_missing_model_expected_deterministic_before_transient() {
        // Contract markers outrank the 5xx-looking token in the same output.
        let verdict = classify_provider_failure(
            "openai",
            "model gpt-9000 not found (request id 500abc)",
            None,
        );
        assert_eq!(verdict.class, FailureClass::Deterministic);
    }

    #[test]
    fn classify_quota_expected_failover_eligible() {
        let verdict = classify_provider_failure("anthropic", "insufficient_quota for account", None);
        assert_eq!(verdict.class, FailureClass::Deterministic);
        assert_eq!(verdict.code.as_deref(), Some(CODE_QUOTA_EXCEEDED));
        assert!(verdict.failover_eligible);
    }

    #[test]
    fn classify_content_filter_expected_no_failover() {
        let verdict = classify_provider_failure("openai", "response blocked by policy", None);
        assert_eq!(verdict.code.as_deref(), Some(CODE_CONTENT_FILTER));
        assert!(!verdict.failover_eligible);
    }

    #[test]
    fn classify_same_input_expected_same_verdict() {
        let a = classify_provider_failure("openai", "connection reset by peer", Some("exit 1"));
        let b = classify_provider_failure("openai", "connection reset by peer", Some("exit 1"));
        assert_eq!(a, b);
    }

    #[test]
    fn turn_budget_outcome_expected_deterministic_retry_with_code() {
        let outcome = turn_budget_exhausted_outcome("anthropic", 40);
        assert_eq!(outcome.status, OutcomeStatus::Retry);
        assert_eq!(outcome.failure_class(), FailureClass::Deterministic);
        assert_eq!(outcome.failure_code(), Some(CODE_TURN_BUDGET_EXHAUSTED));
        assert_eq!(
            outcome.meta_str(META_FAILURE_SIGNATURE),
            Some("agent_turn_limit|anthropic|exhausted")
        );
    }
}
