use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::graph::Node;
use crate::handlers::{conditional::ConditionalHandler, NodeHandler};
use crate::outcome::Outcome;
use async_trait::async_trait;

/// Terminal node. Like a conditional, it executes nothing and preserves the
/// upstream outcome, so a failure that reaches the exit through an
/// unconditional edge still terminates the run as a failure.
#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(&self, exec: &Execution, node: &Node) -> Result<Outcome, AttractorError> {
        ConditionalHandler.execute(exec, node).await
    }
}
