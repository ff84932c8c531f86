use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::graph::Node;
use crate::handlers::NodeHandler;
use crate::outcome::Outcome;
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(&self, _exec: &Execution, _node: &Node) -> Result<Outcome, AttractorError> {
        Ok(Outcome::success())
    }
}
