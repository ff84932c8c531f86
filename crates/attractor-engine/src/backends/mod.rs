use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::graph::Node;
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::sync::Arc;

pub mod agent_loop;
pub mod cli;

pub use agent_loop::{AgentLoopBackend, AgentSession, AgentSessionFactory, TurnBudgetPolicy, TurnResult};
pub use cli::{CliCodergenBackend, ProviderCommand};

/// A codergen invocation target. The engine never performs inference; it
/// hands the prompt to a backend and consumes the resulting [`Outcome`].
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run(
        &self,
        exec: &Execution,
        node: &Node,
        prompt: &str,
        provider: &str,
        model: &str,
    ) -> Result<Outcome, AttractorError>;
}

pub type SharedCodergenBackend = Arc<dyn CodergenBackend>;

/// In-process stand-in used by tests and dry runs. Succeeds unless the node
/// carries a `simulate_outcome` attribute.
#[derive(Debug, Default)]
pub struct SimulatedCodergenBackend;

#[async_trait]
impl CodergenBackend for SimulatedCodergenBackend {
    async fn run(
        &self,
        _exec: &Execution,
        node: &Node,
        _prompt: &str,
        _provider: &str,
        _model: &str,
    ) -> Result<Outcome, AttractorError> {
        match node.attrs.get_str("simulate_outcome") {
            Some("fail") => Ok(Outcome::fail(format!(
                "simulated failure at stage {}",
                node.id
            ))),
            _ => Ok(Outcome::success()),
        }
    }
}
