use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::failure::FailureClass;
use crate::graph::Node;
use crate::handlers::parallel::PARALLEL_RESULTS_KEY;
use crate::handlers::NodeHandler;
use crate::outcome::{Outcome, OutcomeStatus};
use async_trait::async_trait;
use serde_json::Value;

#[derive(Clone, Debug)]
struct BranchCandidate {
    branch_key: String,
    status: OutcomeStatus,
    failure_class: FailureClass,
    failure_reason: Option<String>,
    preferred_label: Option<String>,
}

/// Parallel fan-in: consumes the branch outcomes staged by the fan-out.
///
/// Winner selection: any success-like branch wins, preferring the branch
/// named by the node's `prefer_branch` attribute, then the first branch in
/// edge order. Branches that ended in `retry` are still admitted as
/// winners when nothing succeeded. When every branch failed, the classes
/// aggregate by precedence (any deterministic wins, else all-transient,
/// else deterministic) under a `parallel_all_failed|` signature.
#[derive(Debug, Default)]
pub struct ParallelFanInHandler;

#[async_trait]
impl NodeHandler for ParallelFanInHandler {
    async fn execute(&self, exec: &Execution, node: &Node) -> Result<Outcome, AttractorError> {
        let Some(Value::Array(raw)) = exec.engine.context().get(PARALLEL_RESULTS_KEY) else {
            return Ok(Outcome::fail(format!(
                "fan-in '{}' has no parallel results to aggregate",
                node.id
            )));
        };
        let candidates: Vec<BranchCandidate> = raw.iter().filter_map(parse_candidate).collect();
        if candidates.is_empty() {
            return Ok(Outcome::fail(format!(
                "fan-in '{}' has no parseable parallel results",
                node.id
            )));
        }

        let preferred = node.attrs.get_str("prefer_branch").map(str::trim);

        if let Some(winner) = select_winner(&candidates, preferred) {
            let mut outcome = Outcome {
                status: winner.status,
                failure_reason: winner.failure_reason.clone(),
                preferred_label: winner.preferred_label.clone(),
                meta: Default::default(),
                context_updates: Default::default(),
            };
            outcome.context_updates.insert(
                "parallel.winner".to_string(),
                Value::String(winner.branch_key.clone()),
            );
            return Ok(outcome.normalized());
        }

        // All branches failed: aggregate class by precedence.
        let class = aggregate_class(&candidates);
        let branch_names: Vec<&str> = candidates
            .iter()
            .map(|c| c.branch_key.as_str())
            .collect();
        let reasons: Vec<String> = candidates
            .iter()
            .map(|c| {
                format!(
                    "{}: {}",
                    c.branch_key,
                    c.failure_reason.as_deref().unwrap_or("unspecified failure")
                )
            })
            .collect();

        Ok(Outcome::fail(format!(
            "all {} parallel branches failed ({})",
            candidates.len(),
            reasons.join("; ")
        ))
        .with_class(class)
        .with_signature(format!(
            "parallel_all_failed|{}|{}",
            node.id,
            branch_names.join(",")
        )))
    }
}

fn parse_candidate(value: &Value) -> Option<BranchCandidate> {
    let object = value.as_object()?;
    let branch_key = object.get("branch_key").and_then(Value::as_str)?.to_string();
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .and_then(OutcomeStatus::parse)
        .unwrap_or(OutcomeStatus::Fail);
    let failure_class =
        FailureClass::normalize(object.get("failure_class").and_then(Value::as_str));
    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some(BranchCandidate {
        branch_key,
        status,
        failure_class,
        failure_reason: text("failure_reason"),
        preferred_label: text("preferred_label"),
    })
}

fn select_winner<'a>(
    candidates: &'a [BranchCandidate],
    preferred: Option<&str>,
) -> Option<&'a BranchCandidate> {
    fn pick<'a>(
        candidates: &'a [BranchCandidate],
        preferred: Option<&str>,
        eligible: impl Fn(&BranchCandidate) -> bool,
    ) -> Option<&'a BranchCandidate> {
        if let Some(label) = preferred {
            if let Some(winner) = candidates
                .iter()
                .find(|c| eligible(c) && c.branch_key == label)
            {
                return Some(winner);
            }
        }
        candidates.iter().find(|c| eligible(c))
    }

    pick(candidates, preferred, |c| c.status.is_success_like())
        .or_else(|| pick(candidates, preferred, |c| c.status == OutcomeStatus::Retry))
}

fn aggregate_class(candidates: &[BranchCandidate]) -> FailureClass {
    if candidates
        .iter()
        .any(|c| c.failure_class == FailureClass::Deterministic)
    {
        return FailureClass::Deterministic;
    }
    if !candidates.is_empty()
        && candidates
            .iter()
            .all(|c| c.failure_class == FailureClass::TransientInfra)
    {
        return FailureClass::TransientInfra;
    }
    FailureClass::Deterministic
}
