use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::events::{ProgressEvent, EVENT_BRANCH_COMPLETED, EVENT_BRANCH_STARTED};
use crate::graph::{Graph, Node, NodeType};
use crate::handlers::NodeHandler;
use crate::outcome::Outcome;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub const PARALLEL_RESULTS_KEY: &str = "parallel.results";
pub const PARALLEL_FAN_IN_KEY: &str = "parallel.fan_in";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BranchErrorPolicy {
    FailFast,
    Continue,
}

/// Parallel fan-out: one subgraph engine per outgoing branch, each on an
/// isolated worktree copy with its own logs namespace, sharing the parent's
/// cancellation and progress sink. Branch outcomes are staged into the run
/// context for the matching fan-in node.
#[derive(Debug, Default)]
pub struct ParallelFanOutHandler;

#[async_trait]
impl NodeHandler for ParallelFanOutHandler {
    async fn execute(&self, exec: &Execution, node: &Node) -> Result<Outcome, AttractorError> {
        let graph = exec.engine.graph();
        let branches: Vec<(String, String)> = graph
            .outgoing_edges(&node.id)
            .map(|edge| {
                (
                    edge.label().unwrap_or(edge.to.as_str()).to_string(),
                    edge.to.clone(),
                )
            })
            .collect();
        if branches.is_empty() {
            return Ok(Outcome::fail(format!(
                "parallel fan-out '{}' has no outgoing branches",
                node.id
            )));
        }

        let stop_node = find_fan_in(graph, &node.id);
        let policy = match node.attrs.get_str("error_policy").unwrap_or("continue") {
            "fail_fast" => BranchErrorPolicy::FailFast,
            _ => BranchErrorPolicy::Continue,
        };

        // Child token: fail_fast can stop siblings without canceling the
        // run; run-level cancellation still propagates through the parent.
        let branch_cancel = exec.cancel.child_token();

        let mut tasks = Vec::with_capacity(branches.len());
        for (index, (branch_key, target)) in branches.iter().enumerate() {
            let branch_engine =
                exec.engine
                    .branch_engine(&node.id, branch_key, branch_cancel.clone())?;
            exec.engine.sink().emit(
                ProgressEvent::new(EVENT_BRANCH_STARTED)
                    .node(&node.id)
                    .field("branch_key", branch_key.as_str())
                    .field("branch_index", index as u64)
                    .field("target", target.as_str()),
            );
            let target = target.clone();
            let stop = stop_node.clone();
            let fail_fast = policy == BranchErrorPolicy::FailFast;
            let siblings = branch_cancel.clone();
            let key = branch_key.clone();
            tasks.push(tokio::spawn(async move {
                let result = branch_engine
                    .run_subgraph_until(&target, stop.as_deref())
                    .await;
                if fail_fast && !siblings.is_cancelled() {
                    let failed = match &result {
                        Ok(run) => run
                            .outcome
                            .as_ref()
                            .map(|o| o.status.is_failure_like())
                            .unwrap_or(true),
                        Err(_) => false,
                    };
                    if failed {
                        warn!(branch = %key, "fail_fast branch policy: canceling siblings");
                        siblings.cancel();
                    }
                }
                result
            }));
        }

        let mut results: Vec<Value> = Vec::with_capacity(branches.len());
        let mut fatal: Option<AttractorError> = None;
        for (task, (branch_key, target)) in tasks.into_iter().zip(branches.iter()) {
            let joined = task.await.map_err(|error| {
                AttractorError::Runtime(format!("branch task for '{branch_key}' panicked: {error}"))
            })?;
            let entry = match joined {
                Ok(run) => {
                    let outcome = run
                        .outcome
                        .unwrap_or_else(|| Outcome::fail("branch produced no outcome"));
                    branch_result_entry(branch_key, target, run.last_node, &outcome)
                }
                Err(AttractorError::Canceled(reason)) => branch_result_entry(
                    branch_key,
                    target,
                    None,
                    &Outcome::fail(format!("branch canceled: {reason}"))
                        .with_class(crate::failure::FailureClass::Canceled),
                ),
                Err(error) => {
                    if fatal.is_none() {
                        fatal = Some(error);
                    } else {
                        debug!(branch = %branch_key, "suppressing secondary branch error");
                    }
                    continue;
                }
            };
            exec.engine.sink().emit(
                ProgressEvent::new(EVENT_BRANCH_COMPLETED)
                    .node(&node.id)
                    .field("branch_key", branch_key.as_str())
                    .field(
                        "status",
                        entry.get("status").cloned().unwrap_or(Value::Null),
                    ),
            );
            results.push(entry);
        }

        if let Some(error) = fatal {
            return Err(error);
        }
        if exec.cancel.is_cancelled() {
            return Err(AttractorError::Canceled(
                "parallel fan-out canceled".to_string(),
            ));
        }

        let mut outcome = Outcome::success();
        outcome
            .context_updates
            .insert(PARALLEL_RESULTS_KEY.to_string(), Value::Array(results));
        outcome.context_updates.insert(
            "parallel.fan_out".to_string(),
            Value::String(node.id.clone()),
        );
        // Traversal continues at the join node; the branch edges out of
        // this node were consumed by the branches themselves.
        if let Some(join) = stop_node {
            outcome
                .context_updates
                .insert(PARALLEL_FAN_IN_KEY.to_string(), Value::String(join));
        }
        Ok(outcome)
    }
}

fn branch_result_entry(
    branch_key: &str,
    target: &str,
    last_node: Option<String>,
    outcome: &Outcome,
) -> Value {
    json!({
        "branch_key": branch_key,
        "target": target,
        "last_node": last_node,
        "status": outcome.status.as_str(),
        "failure_class": outcome.failure_class().as_str(),
        "failure_reason": outcome.failure_reason,
        "preferred_label": outcome.preferred_label,
    })
}

/// The join node shared by this fan-out's branches: the first parallel
/// fan-in reachable from any branch target. Branch traversal stops when the
/// next hop would enter it.
fn find_fan_in(graph: &Graph, fan_out_id: &str) -> Option<String> {
    let mut visited = BTreeSet::new();
    let mut stack: Vec<&str> = graph
        .outgoing_edges(fan_out_id)
        .map(|edge| edge.to.as_str())
        .collect();
    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(node) = graph.node(current) {
            if node.node_type() == NodeType::ParallelFanIn {
                return Some(current.to_string());
            }
        }
        for edge in graph.outgoing_edges(current) {
            stack.push(edge.to.as_str());
        }
    }
    None
}
