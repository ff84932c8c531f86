use crate::backends::CodergenBackend;
use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::events::{ProgressEvent, EVENT_TURN_BUDGET_EXTENDED};
use crate::failure::turn_budget_exhausted_outcome;
use crate::graph::Node;
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Result of driving a session up to its current turn cap.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnResult {
    Completed(Outcome),
    /// The session hit the cap before reaching a terminal outcome.
    TurnLimit { turns_used: u32 },
}

/// One live agent session. `run` may be called repeatedly on the same
/// session after a budget extension; turns accumulate across calls.
#[async_trait]
pub trait AgentSession: Send {
    async fn run(&mut self, max_turns: u32) -> Result<TurnResult, AttractorError>;
}

#[async_trait]
pub trait AgentSessionFactory: Send + Sync {
    async fn open(
        &self,
        exec: &Execution,
        node: &Node,
        prompt: &str,
        provider: &str,
        model: &str,
    ) -> Result<Box<dyn AgentSession>, AttractorError>;
}

/// Runtime policy for adaptive turn-budget extension.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnBudgetPolicy {
    pub auto_extend_enabled: bool,
    pub multiplier: u32,
    pub max_extensions: u32,
}

impl Default for TurnBudgetPolicy {
    fn default() -> Self {
        Self {
            auto_extend_enabled: true,
            multiplier: 4,
            max_extensions: 1,
        }
    }
}

/// Codergen backend that drives an in-process agent session with a bounded,
/// extendable turn budget. On turn-limit exhaustion the same session
/// continues under the raised cap; no synthetic user turn is injected. The
/// extension policy comes from the engine's resolved runtime policy.
pub struct AgentLoopBackend {
    factory: Arc<dyn AgentSessionFactory>,
}

impl AgentLoopBackend {
    pub fn new(factory: Arc<dyn AgentSessionFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl CodergenBackend for AgentLoopBackend {
    async fn run(
        &self,
        exec: &Execution,
        node: &Node,
        prompt: &str,
        provider: &str,
        model: &str,
    ) -> Result<Outcome, AttractorError> {
        let policy = exec.engine.turn_budget_policy();
        let mut max_turns = node
            .attrs
            .get_u64("max_agent_turns")
            .map(|v| v as u32)
            .unwrap_or(exec.engine.options().default_max_agent_turns)
            .max(1);

        let mut session = self.factory.open(exec, node, prompt, provider, model).await?;
        let mut extensions_used = 0u32;

        loop {
            if exec.cancel.is_cancelled() {
                return Err(AttractorError::Canceled("agent loop canceled".to_string()));
            }

            match session.run(max_turns).await? {
                TurnResult::Completed(outcome) => return Ok(outcome),
                TurnResult::TurnLimit { turns_used } => {
                    let can_extend =
                        policy.auto_extend_enabled && extensions_used < policy.max_extensions;
                    if !can_extend {
                        debug!(node = %node.id, turns_used, "turn budget exhausted");
                        return Ok(turn_budget_exhausted_outcome(provider, max_turns));
                    }

                    let extended = max_turns.saturating_mul(policy.multiplier.max(1));
                    exec.engine.sink().emit(
                        ProgressEvent::new(EVENT_TURN_BUDGET_EXTENDED)
                            .node(&node.id)
                            .attempt(exec.attempt)
                            .field("from", max_turns)
                            .field("to", extended)
                            .field("turns_used", turns_used),
                    );
                    max_turns = extended;
                    extensions_used += 1;
                }
            }
        }
    }
}
