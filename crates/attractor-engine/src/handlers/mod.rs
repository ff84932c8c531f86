use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::graph::{Node, NodeType};
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod codergen;
pub mod conditional;
pub mod exit;
pub mod fan_in;
pub mod parallel;
pub mod start;
pub mod tool;

/// Per-node-type executor. Ordinary stage failures come back as structured
/// [`Outcome`]s; an `Err` is reserved for engine invariant violations and
/// cancellation.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, exec: &Execution, node: &Node) -> Result<Outcome, AttractorError>;
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;

/// Handler lookup: a custom `type` attribute wins over the shape-derived
/// node type, so tests and extensions can override individual nodes.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type_name: BTreeMap<String, SharedNodeHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, handler: SharedNodeHandler) {
        self.by_type_name.insert(type_name.into(), handler);
    }

    pub fn resolve(&self, node: &Node) -> Option<SharedNodeHandler> {
        if let Some(explicit) = node.attrs.get_str("type") {
            if let Some(handler) = self.by_type_name.get(explicit.trim()) {
                return Some(handler.clone());
            }
        }
        self.by_type_name
            .get(node.node_type().as_str())
            .cloned()
    }
}

pub fn core_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(NodeType::Start.as_str(), Arc::new(start::StartHandler));
    registry.register(NodeType::Exit.as_str(), Arc::new(exit::ExitHandler));
    registry.register(NodeType::Tool.as_str(), Arc::new(tool::ToolHandler));
    registry.register(
        NodeType::Codergen.as_str(),
        Arc::new(codergen::CodergenHandler),
    );
    registry.register(
        NodeType::Conditional.as_str(),
        Arc::new(conditional::ConditionalHandler),
    );
    registry.register(
        NodeType::ParallelFanOut.as_str(),
        Arc::new(parallel::ParallelFanOutHandler),
    );
    registry.register(
        NodeType::ParallelFanIn.as_str(),
        Arc::new(fan_in::ParallelFanInHandler),
    );
    registry
}
