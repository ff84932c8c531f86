use crate::condition::validate_condition;
use crate::errors::{AttractorError, ValidationError};
use crate::graph::{Graph, NodeType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub rule: String,
    pub message: String,
}

impl Diagnostic {
    pub fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            rule: rule.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(rule: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            rule: rule.to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Structural lints for a parsed graph. Errors block execution; warnings
/// are surfaced by `validate` but do not.
pub fn validate_graph(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let start_nodes: Vec<_> = graph
        .nodes
        .values()
        .filter(|node| node.node_type() == NodeType::Start)
        .collect();
    match start_nodes.len() {
        0 => diagnostics.push(Diagnostic::error(
            "start_node",
            "graph has no start node (shape=Mdiamond)",
        )),
        1 => {
            let start = start_nodes[0];
            let outgoing = graph.outgoing_edges(&start.id).count();
            if outgoing != 1 {
                diagnostics.push(Diagnostic::error(
                    "start_single_edge",
                    format!(
                        "start node '{}' must have exactly one outgoing edge, found {}",
                        start.id, outgoing
                    ),
                ));
            }
        }
        n => diagnostics.push(Diagnostic::error(
            "start_node",
            format!("graph has {n} start nodes, expected exactly one"),
        )),
    }

    let exit_count = graph.exit_nodes().len();
    if exit_count > 1 {
        diagnostics.push(Diagnostic::error(
            "exit_node",
            format!("graph has {exit_count} exit nodes, expected at most one"),
        ));
    }

    for edge in &graph.edges {
        if let Some(condition) = edge.condition() {
            if let Err(reason) = validate_condition(condition) {
                diagnostics.push(Diagnostic::error(
                    "edge_condition",
                    format!("edge {} -> {}: {}", edge.from, edge.to, reason),
                ));
            }
        }
    }

    for (scope, attrs) in std::iter::once(("graph", &graph.attrs)).chain(
        graph
            .nodes
            .values()
            .map(|node| (node.id.as_str(), &node.attrs)),
    ) {
        for key in ["retry_target", "fallback_retry_target"] {
            if let Some(target) = attrs.get_str(key) {
                let target = target.trim();
                if !target.is_empty() && !graph.nodes.contains_key(target) {
                    diagnostics.push(Diagnostic::error(
                        "retry_target",
                        format!("{scope}: {key} '{target}' does not name a node"),
                    ));
                }
            }
        }
    }

    for node in graph.nodes.values() {
        match node.node_type() {
            NodeType::Tool => {
                if node
                    .attrs
                    .get_str("tool_command")
                    .unwrap_or_default()
                    .trim()
                    .is_empty()
                {
                    diagnostics.push(Diagnostic::error(
                        "tool_command",
                        format!("tool node '{}' has no tool_command", node.id),
                    ));
                }
            }
            NodeType::ParallelFanOut => {
                let branches = graph.outgoing_edges(&node.id).count();
                if branches == 0 {
                    diagnostics.push(Diagnostic::error(
                        "fanout_branches",
                        format!("parallel fan-out '{}' has no outgoing branches", node.id),
                    ));
                }
            }
            _ => {}
        }
    }

    let reachable = reachable_from_start(graph);
    if !reachable.is_empty() {
        for node in graph.nodes.values() {
            if !reachable.contains(node.id.as_str()) {
                diagnostics.push(Diagnostic::warning(
                    "unreachable_node",
                    format!("node '{}' is not reachable from the start node", node.id),
                ));
            }
        }
    }

    diagnostics
}

fn reachable_from_start(graph: &Graph) -> BTreeSet<&str> {
    let mut reachable = BTreeSet::new();
    let Some(start) = graph.start_node() else {
        return reachable;
    };
    let mut stack = vec![start.id.as_str()];
    while let Some(current) = stack.pop() {
        if !reachable.insert(current) {
            continue;
        }
        for edge in graph.outgoing_edges(current) {
            stack.push(edge.to.as_str());
        }
    }
    reachable
}

pub fn validate_or_raise(graph: &Graph) -> Result<Vec<Diagnostic>, AttractorError> {
    let diagnostics = validate_graph(graph);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics).into());
    }
    Ok(diagnostics)
}
