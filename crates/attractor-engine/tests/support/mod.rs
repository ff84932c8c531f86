#![allow(dead_code)]

use async_trait::async_trait;
use attractor_engine::{
    core_registry, parse_dot, AttractorError, Engine, EngineConfig, Execution, Graph,
    HandlerRegistry, Node, NodeHandler, Outcome, PreflightMode, ProgressEvent, RunOptions,
    RunResult,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Handler returning a scripted sequence of outcomes; the last entry
/// repeats once the script runs out.
pub struct ScriptedHandler {
    outcomes: Mutex<Vec<Outcome>>,
    pub calls: AtomicU32,
}

impl ScriptedHandler {
    pub fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            calls: AtomicU32::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeHandler for ScriptedHandler {
    async fn execute(&self, _exec: &Execution, _node: &Node) -> Result<Outcome, AttractorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let outcomes = self.outcomes.lock().expect("outcomes mutex should lock");
        if outcomes.is_empty() {
            return Ok(Outcome::fail("no scripted outcomes"));
        }
        Ok(outcomes[call.min(outcomes.len() - 1)].clone())
    }
}

pub fn test_options(logs_root: PathBuf) -> RunOptions {
    RunOptions {
        run_id: Some("test-run".to_string()),
        logs_root,
        preflight: PreflightMode::Skip,
        ..RunOptions::default()
    }
}

pub fn registry_with(
    entries: Vec<(&str, Arc<dyn NodeHandler>)>,
) -> HandlerRegistry {
    let mut registry = core_registry();
    for (name, handler) in entries {
        registry.register(name, handler);
    }
    registry
}

pub async fn run_graph(
    dot: &str,
    options: RunOptions,
    registry: HandlerRegistry,
) -> Result<RunResult, AttractorError> {
    let graph: Graph = parse_dot(dot)?;
    Engine::run(
        graph,
        options,
        EngineConfig {
            registry: Some(registry),
            ..EngineConfig::default()
        },
    )
    .await
}

pub fn events(logs_root: &Path) -> Vec<ProgressEvent> {
    attractor_engine::events::read_progress_events(&logs_root.join("progress.ndjson"))
}

pub fn event_count(events: &[ProgressEvent], name: &str) -> usize {
    events.iter().filter(|e| e.event == name).count()
}

pub fn events_for_node<'a>(
    events: &'a [ProgressEvent],
    name: &str,
    node_id: &str,
) -> Vec<&'a ProgressEvent> {
    events
        .iter()
        .filter(|e| e.event == name && e.node_id.as_deref() == Some(node_id))
        .collect()
}
