use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::failure::FailureClass;
use crate::graph::Node;
use crate::handlers::NodeHandler;
use crate::outcome::{Outcome, OutcomeStatus};
use async_trait::async_trait;
use serde_json::Value;

/// Pure routing predicate. Executes nothing; the outcome mirrors the
/// previous node's status, label, reason, and class so downstream edge
/// conditions can route on upstream causality.
#[derive(Debug, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    async fn execute(&self, exec: &Execution, _node: &Node) -> Result<Outcome, AttractorError> {
        let context = exec.engine.context();

        let status = context
            .get("outcome")
            .as_ref()
            .and_then(Value::as_str)
            .and_then(OutcomeStatus::parse)
            .unwrap_or(OutcomeStatus::Success);

        let non_empty = |value: Option<Value>| {
            value
                .as_ref()
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let mut outcome = Outcome {
            status,
            failure_reason: non_empty(context.get("failure_reason")),
            preferred_label: non_empty(context.get("preferred_label")),
            meta: Default::default(),
            context_updates: Default::default(),
        };
        let class = FailureClass::normalize(
            context.get("failure_class").as_ref().and_then(Value::as_str),
        );
        if status.is_failure_like() {
            outcome = outcome.with_class(class);
            if let Some(signature) = non_empty(context.get("failure_signature")) {
                outcome = outcome.with_signature(signature);
            }
        }
        Ok(outcome.normalized())
    }
}
