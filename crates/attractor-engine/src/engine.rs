use crate::artifacts::{
    self, branch_logs_root, read_final, stage_dir, write_final, write_manifest, FinalOutcome,
    RunManifest,
};
use crate::backends::{SharedCodergenBackend, SimulatedCodergenBackend, TurnBudgetPolicy};
use crate::checkpoint::Checkpoint;
use crate::condition::Condition;
use crate::context::ContextStore;
use crate::errors::AttractorError;
use crate::events::*;
use crate::failure::{failure_signature, should_retry_outcome, FailureClass};
use crate::fsutil::{atomic_write_bytes, copy_dir_recursive, ensure_dir};
use crate::gitutil::{GitWorktree, DEFAULT_CHECKPOINT_EXCLUDE_GLOBS};
use crate::graph::{Edge, Graph, Node, NodeType};
use crate::handlers::{core_registry, HandlerRegistry};
use crate::modeldb::{pin_snapshot, ModelCatalog};
use crate::outcome::{Outcome, OutcomeStatus};
use crate::preflight::{run_preflight, PreflightMode, PromptProber};
use crate::retry::{build_retry_policy, delay_for_attempt_ms};
use crate::store::{spawn_store_forwarder, SharedEventStoreSink};
use crate::validate::validate_or_raise;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_STATUS_FALLBACK_RELPATH: &str = ".attractor/status.json";

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub logs_root: PathBuf,
    /// Source repository cloned into the worktree. When unset, the worktree
    /// starts as an empty repository.
    pub repo_path: Option<PathBuf>,
    pub worktree_dir: Option<PathBuf>,
    pub backoff: crate::retry::RetryBackoffConfig,
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    pub heartbeat_interval: Duration,
    pub default_max_agent_turns: u32,
    pub turn_budget: TurnBudgetPolicy,
    /// Provider failover chain consulted on quota exhaustion. `None` means
    /// no chain was configured; `Some(vec![])` pins explicitly.
    pub failover_chain: Option<Vec<String>>,
    /// Worktree-relative status fallback locations, in precedence order.
    /// The status-contract preamble, the exported
    /// `STAGE_STATUS_FALLBACK_PATH`, and ingestion all derive from this
    /// one list.
    pub status_fallback_relpaths: Vec<String>,
    pub checkpoint_exclude_globs: Vec<String>,
    pub restart_signature_limit: u32,
    pub max_restarts: u32,
    pub deterministic_cycle_limit: u32,
    pub max_node_visits: u32,
    pub catalog_snapshot: Option<PathBuf>,
    pub preflight: PreflightMode,
    pub strict_capabilities: bool,
    pub default_provider: String,
    pub default_model: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            logs_root: PathBuf::from("attractor-logs"),
            repo_path: None,
            worktree_dir: None,
            backoff: Default::default(),
            stall_timeout: Duration::from_secs(15 * 60),
            stall_check_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            default_max_agent_turns: 10,
            turn_budget: TurnBudgetPolicy::default(),
            failover_chain: None,
            status_fallback_relpaths: vec![DEFAULT_STATUS_FALLBACK_RELPATH.to_string()],
            checkpoint_exclude_globs: DEFAULT_CHECKPOINT_EXCLUDE_GLOBS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            restart_signature_limit: 3,
            max_restarts: 10,
            deterministic_cycle_limit: 3,
            max_node_visits: 25,
            catalog_snapshot: None,
            preflight: PreflightMode::Skip,
            strict_capabilities: false,
            default_provider: "anthropic".to_string(),
            default_model: "claude-sonnet-4-5".to_string(),
        }
    }
}

impl RunOptions {
    /// Absolute worktree fallback paths for stage status payloads, in
    /// precedence order.
    pub fn status_fallback_paths(&self, worktree_dir: &Path) -> Vec<PathBuf> {
        self.status_fallback_relpaths
            .iter()
            .map(|rel| worktree_dir.join(rel))
            .collect()
    }

    /// The fallback path advertised to stage subprocesses. Always present,
    /// even when the configured list is empty.
    pub fn primary_status_fallback(&self, worktree_dir: &Path) -> PathBuf {
        self.status_fallback_relpaths
            .first()
            .map(|rel| worktree_dir.join(rel))
            .unwrap_or_else(|| worktree_dir.join(DEFAULT_STATUS_FALLBACK_RELPATH))
    }
}

/// Collaborators injected into a run. Everything has a working default:
/// simulated backend, core handler registry, no external store, no API
/// prober.
#[derive(Clone, Default)]
pub struct EngineConfig {
    pub backend: Option<SharedCodergenBackend>,
    pub registry: Option<HandlerRegistry>,
    pub store: Option<SharedEventStoreSink>,
    pub prober: Option<Arc<dyn PromptProber>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub final_outcome: FinalOutcome,
    pub completed_nodes: Vec<String>,
    pub logs_root: PathBuf,
    pub worktree_dir: PathBuf,
}

/// Per-attempt handle passed to node handlers.
#[derive(Clone)]
pub struct Execution {
    pub engine: Engine,
    pub attempt: u32,
    pub stage_logs_dir: PathBuf,
    pub worktree_dir: PathBuf,
    pub cancel: CancellationToken,
}

/// Result of a branch subgraph traversal.
#[derive(Clone, Debug)]
pub struct BranchRun {
    pub last_node: Option<String>,
    pub outcome: Option<Outcome>,
    pub completed: Vec<String>,
}

struct RestartState {
    total_restarts: u32,
    signature_counts: BTreeMap<String, u32>,
    cycle_counts: BTreeMap<String, u32>,
}

struct EngineInner {
    graph: Arc<Graph>,
    options: Arc<RunOptions>,
    run_id: String,
    logs_root: PathBuf,
    worktree_dir: PathBuf,
    context: ContextStore,
    registry: Arc<HandlerRegistry>,
    backend: SharedCodergenBackend,
    sink: ProgressSink,
    cancel: CancellationToken,
    cancel_cause: Mutex<Option<String>>,
    git_lock: tokio::sync::Mutex<()>,
    finalized: Mutex<bool>,
    restart: Mutex<RestartState>,
    catalog: Option<ModelCatalog>,
    is_branch: bool,
}

/// One pipeline run. Cheap to clone; clones share all run state. Branch
/// engines are derived via [`Engine::branch_engine`] with their own
/// context, logs namespace, and worktree.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

enum NextHop {
    Edge(Edge),
    Terminal,
}

enum LoopControl {
    Continue { next: String, reset_retries: bool },
    Finished(Outcome),
    Abort(String),
}

impl Engine {
    /// Execute a graph from scratch. Initializes the logs root and
    /// worktree, runs preflight, traverses, and always finalizes.
    pub async fn run(
        graph: Graph,
        options: RunOptions,
        config: EngineConfig,
    ) -> Result<RunResult, AttractorError> {
        validate_or_raise(&graph)?;
        let mut graph = graph;
        crate::stylesheet::apply_model_stylesheet(&mut graph)?;

        let engine = Self::build(graph, options, config.clone(), None)?;
        engine.write_startup_artifacts()?;

        if let Some(reason) = engine.preflight_gate(config.prober.clone()).await? {
            let final_outcome = engine.finalize_fail(&reason, "preflight");
            return Ok(engine.run_result(final_outcome, Vec::new()));
        }

        engine.init_worktree()?;
        engine.spawn_watchdog();

        let start = engine
            .inner
            .graph
            .start_node()
            .ok_or_else(|| AttractorError::InvalidGraph("graph has no start node".to_string()))?
            .id
            .clone();
        let outcome = engine.traverse(start, Vec::new(), BTreeMap::new()).await;
        engine.conclude(outcome)
    }

    /// Continue a run from its checkpoint. Completed nodes are not
    /// re-executed; refuses to touch a run that already has a `final.json`.
    pub async fn resume(
        logs_root: &Path,
        options: RunOptions,
        config: EngineConfig,
    ) -> Result<RunResult, AttractorError> {
        if read_final(logs_root).is_some() {
            return Err(AttractorError::Runtime(format!(
                "run at {} is already finalized",
                logs_root.display()
            )));
        }
        let manifest = artifacts::read_manifest(logs_root)?;
        let dot = std::fs::read_to_string(logs_root.join(artifacts::GRAPH_FILE))
            .map_err(|error| AttractorError::io(logs_root.join(artifacts::GRAPH_FILE), error))?;
        let mut graph = crate::parse::parse_dot(&dot)?;
        crate::stylesheet::apply_model_stylesheet(&mut graph)?;

        let checkpoint = Checkpoint::load(logs_root)?;
        let mut options = options;
        options.run_id = Some(manifest.run_id.clone());
        options.logs_root = logs_root.to_path_buf();
        options.worktree_dir = Some(PathBuf::from(&manifest.worktree_dir));

        let engine = Self::build(graph, options, config, Some(checkpoint.context.clone()))?;
        engine.write_pid_file()?;
        engine.init_worktree()?;
        engine.spawn_watchdog();
        engine.sink().emit(
            ProgressEvent::new(EVENT_RUN_STARTED)
                .field("resumed", true)
                .field("from_node", checkpoint.current_node.clone()),
        );

        let next = match checkpoint.next_node.clone() {
            Some(next) => Some(next),
            None => engine.infer_next_from_checkpoint(&checkpoint),
        };
        let Some(next) = next else {
            // Nothing left to execute: the checkpointed node was terminal.
            let final_outcome = match checkpoint.last_outcome() {
                Some(outcome) if outcome.status.is_failure_like() => engine.finalize_fail(
                    outcome
                        .failure_reason
                        .as_deref()
                        .unwrap_or("unspecified failure"),
                    "resume",
                ),
                _ => engine.finalize_success(),
            };
            return Ok(engine.run_result(final_outcome, checkpoint.completed_nodes));
        };

        let outcome = engine
            .traverse(next, checkpoint.completed_nodes, checkpoint.node_retries)
            .await;
        engine.conclude(outcome)
    }

    fn build(
        graph: Graph,
        options: RunOptions,
        config: EngineConfig,
        seed_context: Option<crate::context::ContextValues>,
    ) -> Result<Self, AttractorError> {
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", graph.id, uuid::Uuid::new_v4().simple()));
        let logs_root = options.logs_root.clone();
        ensure_dir(&logs_root)?;

        let worktree_dir = options
            .worktree_dir
            .clone()
            .unwrap_or_else(|| logs_root.join("worktree"));

        let mut sink = ProgressSink::new(run_id.clone(), Some(logs_root.clone()));
        if let Some(store) = config.store {
            let (tx, _handle) = spawn_store_forwarder(store);
            sink = sink.with_store_sender(tx);
        }

        let context = match seed_context {
            Some(values) => ContextStore::from_values(values),
            None => {
                let context = ContextStore::new();
                for (key, value) in graph.attrs.values() {
                    context.set(
                        format!("graph.{key}"),
                        serde_json::Value::String(value.to_string_value()),
                    );
                }
                context
            }
        };

        let catalog = match options.catalog_snapshot.as_ref() {
            Some(path) => Some(ModelCatalog::load(path)?),
            None => None,
        };

        let options = Arc::new(resolve_graph_policy_overrides(options, &graph));

        Ok(Self {
            inner: Arc::new(EngineInner {
                graph: Arc::new(graph),
                options,
                run_id,
                logs_root,
                worktree_dir,
                context,
                registry: Arc::new(config.registry.unwrap_or_else(core_registry)),
                backend: config
                    .backend
                    .unwrap_or_else(|| Arc::new(SimulatedCodergenBackend)),
                sink,
                cancel: CancellationToken::new(),
                cancel_cause: Mutex::new(None),
                git_lock: tokio::sync::Mutex::new(()),
                finalized: Mutex::new(false),
                restart: Mutex::new(RestartState {
                    total_restarts: 0,
                    signature_counts: BTreeMap::new(),
                    cycle_counts: BTreeMap::new(),
                }),
                catalog,
                is_branch: false,
            }),
        })
    }

    // Accessors used by handlers and backends.

    pub fn options(&self) -> &RunOptions {
        &self.inner.options
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    pub fn context(&self) -> &ContextStore {
        &self.inner.context
    }

    pub fn sink(&self) -> &ProgressSink {
        &self.inner.sink
    }

    pub fn backend(&self) -> &SharedCodergenBackend {
        &self.inner.backend
    }

    pub fn logs_root(&self) -> &Path {
        &self.inner.logs_root
    }

    pub fn worktree_dir(&self) -> &Path {
        &self.inner.worktree_dir
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn catalog(&self) -> Option<&ModelCatalog> {
        self.inner.catalog.as_ref()
    }

    pub fn turn_budget_policy(&self) -> TurnBudgetPolicy {
        self.inner.options.turn_budget.clone()
    }

    /// Cancel the run, recording the cause surfaced in `final.json`.
    pub fn cancel_with_cause(&self, cause: &str) {
        {
            let mut slot = self
                .inner
                .cancel_cause
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(cause.to_string());
            }
        }
        self.inner.cancel.cancel();
    }

    fn cancel_cause(&self) -> String {
        self.inner
            .cancel_cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "canceled".to_string())
    }

    // Startup plumbing.

    fn write_startup_artifacts(&self) -> Result<(), AttractorError> {
        self.write_pid_file()?;
        write_manifest(
            &self.inner.logs_root,
            &RunManifest {
                run_id: self.inner.run_id.clone(),
                graph_id: self.inner.graph.id.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
                logs_root: self.inner.logs_root.display().to_string(),
                worktree_dir: self.inner.worktree_dir.display().to_string(),
                repo_path: self
                    .inner
                    .options
                    .repo_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                pid: std::process::id(),
            },
        )?;
        if let Some(dot) = self.inner.graph.source_dot.as_deref() {
            atomic_write_bytes(&self.inner.logs_root.join(artifacts::GRAPH_FILE), dot.as_bytes())?;
        }
        if let Some(snapshot) = self.inner.options.catalog_snapshot.as_ref() {
            pin_snapshot(snapshot, &self.inner.logs_root)?;
        }
        self.sink().emit(
            ProgressEvent::new(EVENT_RUN_STARTED).field("graph_id", self.inner.graph.id.clone()),
        );
        Ok(())
    }

    fn write_pid_file(&self) -> Result<(), AttractorError> {
        atomic_write_bytes(
            &self.inner.logs_root.join(artifacts::PID_FILE),
            format!("{}\n", std::process::id()).as_bytes(),
        )
    }

    async fn preflight_gate(
        &self,
        prober: Option<Arc<dyn PromptProber>>,
    ) -> Result<Option<String>, AttractorError> {
        if self.inner.options.preflight == PreflightMode::Skip {
            return Ok(None);
        }
        let report = run_preflight(self, prober).await?;
        self.sink().emit(
            ProgressEvent::new(EVENT_PREFLIGHT_COMPLETED)
                .field("passed", report.passed())
                .field("fail_count", report.fail_count() as u64)
                .field("warn_count", report.warn_count() as u64),
        );
        if report.passed() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "preflight failed: {}",
                report.failure_summary()
            )))
        }
    }

    fn init_worktree(&self) -> Result<(), AttractorError> {
        let worktree = &self.inner.worktree_dir;
        if !worktree.exists() {
            match self.inner.options.repo_path.as_ref() {
                Some(repo) => {
                    GitWorktree::clone_local(repo, worktree)?;
                }
                None => {
                    ensure_dir(worktree)?;
                }
            }
        }
        GitWorktree::new(worktree).init_if_needed()
    }

    fn spawn_watchdog(&self) {
        let engine = self.clone();
        let stall_timeout = self.inner.options.stall_timeout;
        let interval = self.inner.options.stall_check_interval;
        self.sink().touch();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.inner.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let idle = engine.sink().idle_for();
                if idle >= stall_timeout {
                    warn!(idle_ms = idle.as_millis() as u64, "stall watchdog firing");
                    engine.cancel_with_cause(&format!(
                        "stall watchdog timeout: no progress for {}ms",
                        idle.as_millis()
                    ));
                    return;
                }
            }
        });
    }

    // Traversal.

    async fn traverse(
        &self,
        start_node: String,
        completed_seed: Vec<String>,
        retries_seed: BTreeMap<String, u32>,
    ) -> Result<(Outcome, Vec<String>), AttractorError> {
        let mut current = start_node;
        let mut completed = completed_seed;
        let mut retries = retries_seed;
        let mut visits: BTreeMap<String, u32> = BTreeMap::new();
        let mut node_outcomes: BTreeMap<String, Outcome> = BTreeMap::new();

        loop {
            if self.inner.cancel.is_cancelled() {
                self.sink()
                    .emit(ProgressEvent::new(EVENT_TRAVERSAL_CANCELED).node(&current));
                return Err(AttractorError::Canceled(self.cancel_cause()));
            }

            let node = self
                .inner
                .graph
                .node(&current)
                .ok_or_else(|| {
                    AttractorError::InvalidGraph(format!("traversal reached unknown node '{current}'"))
                })?
                .clone();

            let visit_count = visits.entry(node.id.clone()).or_insert(0);
            *visit_count += 1;
            if *visit_count > self.inner.options.max_node_visits {
                return Ok((
                    Outcome::fail(format!(
                        "node '{}' exceeded max_node_visits ({})",
                        node.id, self.inner.options.max_node_visits
                    )),
                    completed,
                ));
            }

            let outcome = match self.execute_with_retry(&node, &mut retries).await {
                Ok(outcome) => outcome,
                Err(AttractorError::Canceled(cause)) => {
                    self.sink()
                        .emit(ProgressEvent::new(EVENT_TRAVERSAL_CANCELED).node(&node.id));
                    return Err(AttractorError::Canceled(cause));
                }
                Err(error) => return Err(error),
            };
            completed.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.clone());
            self.inner.context.apply_outcome(&node.id, &outcome);

            self.checkpoint(&node.id, None, &completed, &retries, &node_outcomes)
                .await?;

            if node.node_type() == NodeType::Exit {
                return Ok((self.terminal_outcome(outcome, &node_outcomes), completed));
            }

            match self
                .advance(&node, &outcome, &completed, &retries, &node_outcomes)
                .await?
            {
                LoopControl::Continue {
                    next,
                    reset_retries,
                } => {
                    if reset_retries {
                        retries.clear();
                    }
                    current = next;
                }
                LoopControl::Finished(final_outcome) => {
                    return Ok((
                        self.terminal_outcome(final_outcome, &node_outcomes),
                        completed,
                    ));
                }
                LoopControl::Abort(reason) => {
                    return Ok((Outcome::fail(reason), completed));
                }
            }
        }
    }

    /// Select the next hop and apply the restart/cycle policies.
    async fn advance(
        &self,
        node: &Node,
        outcome: &Outcome,
        completed: &[String],
        retries: &BTreeMap<String, u32>,
        node_outcomes: &BTreeMap<String, Outcome>,
    ) -> Result<LoopControl, AttractorError> {
        let next_edge = match self.resolve_next_hop(node, outcome) {
            NextHop::Terminal => return Ok(LoopControl::Finished(outcome.clone())),
            NextHop::Edge(edge) => edge,
        };

        // Record the resolved hop so resume can continue exactly here.
        self.checkpoint(&node.id, Some(&next_edge.to), completed, retries, node_outcomes)
            .await?;

        if next_edge.is_loop_restart() {
            return self.apply_restart_policy(node, outcome, &next_edge);
        }

        // Deterministic failure cycle breaker: a plain back-edge revisiting
        // old ground with the same deterministic signature only gets a
        // bounded number of passes.
        if outcome.status.is_failure_like()
            && outcome.failure_class() == FailureClass::Deterministic
            && completed.contains(&next_edge.to)
        {
            let signature = failure_signature(&node.id, outcome);
            let count = {
                let mut restart = self.inner.restart.lock().unwrap_or_else(|e| e.into_inner());
                let count = restart.cycle_counts.entry(signature.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let limit = self.inner.options.deterministic_cycle_limit;
            if count >= limit {
                self.sink().emit(
                    ProgressEvent::new(EVENT_CYCLE_BREAK)
                        .node(&node.id)
                        .field("signature", signature.clone())
                        .field("count", count)
                        .field("limit", limit),
                );
                return Ok(LoopControl::Abort(format!(
                    "deterministic failure cycle detected at '{}' (signature {signature}, {count} passes)",
                    node.id
                )));
            }
        }

        Ok(LoopControl::Continue {
            next: next_edge.to,
            reset_retries: false,
        })
    }

    /// Loop-restart policy: transient failures only, capped per failure
    /// signature (the circuit breaker) and in total. An allowed restart
    /// renews the per-iteration attempt budgets.
    fn apply_restart_policy(
        &self,
        node: &Node,
        outcome: &Outcome,
        edge: &Edge,
    ) -> Result<LoopControl, AttractorError> {
        let class = outcome.failure_class();
        let signature = failure_signature(&node.id, outcome);
        let signature_limit = self.inner.options.restart_signature_limit;
        let max_restarts = self.inner.options.max_restarts;

        if class != FailureClass::TransientInfra {
            self.sink().emit(
                ProgressEvent::new(EVENT_LOOP_RESTART_BLOCKED)
                    .node(&node.id)
                    .field("failure_class", class.as_str())
                    .field("signature", signature.clone()),
            );
            return Ok(LoopControl::Abort(format!(
                "loop restart blocked at '{}': failure class {} is not restartable",
                node.id,
                class.as_str()
            )));
        }

        let mut restart = self.inner.restart.lock().unwrap_or_else(|e| e.into_inner());
        let count = restart
            .signature_counts
            .get(&signature)
            .copied()
            .unwrap_or(0);
        if count >= signature_limit {
            drop(restart);
            self.sink().emit(
                ProgressEvent::new(EVENT_LOOP_RESTART_BLOCKED)
                    .node(&node.id)
                    .field("signature", signature.clone())
                    .field("count", count)
                    .field("threshold", signature_limit),
            );
            return Ok(LoopControl::Abort(format!(
                "loop restart circuit breaker tripped at '{}': signature '{}' restarted {} times (threshold {})",
                node.id, signature, count, signature_limit
            )));
        }
        if restart.total_restarts >= max_restarts {
            let total = restart.total_restarts;
            drop(restart);
            self.sink().emit(
                ProgressEvent::new(EVENT_LOOP_RESTART_BLOCKED)
                    .node(&node.id)
                    .field("signature", signature.clone())
                    .field("total_restarts", total)
                    .field("max_restarts", max_restarts),
            );
            return Ok(LoopControl::Abort(format!(
                "max_restarts exceeded at '{}' ({} of {})",
                node.id, total, max_restarts
            )));
        }

        *restart
            .signature_counts
            .entry(signature.clone())
            .or_insert(0) += 1;
        restart.total_restarts += 1;
        let total = restart.total_restarts;
        drop(restart);

        self.sink().emit(
            ProgressEvent::new(EVENT_LOOP_RESTART)
                .node(&node.id)
                .field("target", edge.to.clone())
                .field("signature", signature)
                .field("restart_no", total)
                .field("retry_budget_reset", true),
        );
        Ok(LoopControl::Continue {
            next: edge.to.clone(),
            reset_retries: true,
        })
    }

    /// Routing: first condition match in declared edge order, then the
    /// preferred-label hint, then unconditional edges, then the retry
    /// target chain. Fan-in sources skip unconditional edges on failure.
    fn resolve_next_hop(&self, node: &Node, outcome: &Outcome) -> NextHop {
        let graph = &self.inner.graph;
        let context = self.inner.context.snapshot();

        // A fan-out's outgoing edges are its branch edges, already consumed
        // by the branch engines; traversal continues at the join node the
        // handler recorded.
        if node.node_type() == NodeType::ParallelFanOut {
            if let Some(serde_json::Value::String(join)) =
                context.get(crate::handlers::parallel::PARALLEL_FAN_IN_KEY)
            {
                return NextHop::Edge(Edge {
                    from: node.id.clone(),
                    to: join.clone(),
                    attrs: Default::default(),
                });
            }
            return NextHop::Terminal;
        }

        let edges: Vec<&Edge> = graph.outgoing_edges(&node.id).collect();
        let failing = outcome.status.is_failure_like();
        let fan_in_failure = failing && node.node_type() == NodeType::ParallelFanIn;

        for edge in &edges {
            if let Some(raw) = edge.condition() {
                match Condition::parse(raw) {
                    Ok(condition) if condition.evaluate(&context) => {
                        return NextHop::Edge((*edge).clone());
                    }
                    Ok(_) => {}
                    Err(reason) => {
                        warn!(edge = %format!("{} -> {}", edge.from, edge.to), %reason, "unparseable edge condition skipped");
                    }
                }
            }
        }

        // Fan-in failure precedence: unconditional edges (and label hints
        // on them) are skipped; only conditional matches above or the
        // retry-target chain below may route a failed aggregate.
        if !fan_in_failure {
            if let Some(label) = outcome
                .preferred_label
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
            {
                if let Some(edge) = edges.iter().find(|edge| {
                    edge.condition().is_none()
                        && edge
                            .label()
                            .map(|l| l.eq_ignore_ascii_case(label))
                            .unwrap_or(false)
                }) {
                    return NextHop::Edge((*edge).clone());
                }
            }

            if let Some(edge) = edges.iter().find(|edge| edge.condition().is_none()) {
                return NextHop::Edge((*edge).clone());
            }
        }

        if failing {
            if let Some(target) = self.resolve_retry_target(node) {
                debug!(node = %node.id, %target, "routing failure to retry target");
                return NextHop::Edge(Edge {
                    from: node.id.clone(),
                    to: target,
                    attrs: Default::default(),
                });
            }
        }

        NextHop::Terminal
    }

    fn resolve_retry_target(&self, node: &Node) -> Option<String> {
        let graph = &self.inner.graph;
        let candidates = [
            node.attrs.get_str("retry_target"),
            graph.attrs.get_str("retry_target"),
            graph.attrs.get_str("fallback_retry_target"),
        ];
        for candidate in candidates.into_iter().flatten() {
            let candidate = candidate.trim();
            if !candidate.is_empty() && graph.nodes.contains_key(candidate) {
                return Some(candidate.to_string());
            }
        }
        None
    }

    /// Goal gates: a run only succeeds when every `goal_gate` node that
    /// executed reached success.
    fn terminal_outcome(
        &self,
        outcome: Outcome,
        node_outcomes: &BTreeMap<String, Outcome>,
    ) -> Outcome {
        if outcome.status.is_failure_like() {
            return outcome;
        }
        for (node_id, node_outcome) in node_outcomes {
            let Some(node) = self.inner.graph.node(node_id) else {
                continue;
            };
            if node.is_goal_gate() && !node_outcome.status.is_success_like() {
                return Outcome::fail(format!(
                    "goal gate '{}' did not reach success (status {})",
                    node_id,
                    node_outcome.status.as_str()
                ));
            }
        }
        outcome
    }

    // Retry gate.

    /// Wraps a single node execution with the class-gated retry loop and
    /// the attempt event envelope.
    pub async fn execute_with_retry(
        &self,
        node: &Node,
        retries: &mut BTreeMap<String, u32>,
    ) -> Result<Outcome, AttractorError> {
        let handler = self.inner.registry.resolve(node).ok_or_else(|| {
            AttractorError::InvalidGraph(format!(
                "no handler registered for node '{}' (type {})",
                node.id,
                node.node_type().as_str()
            ))
        })?;
        let policy = build_retry_policy(
            node,
            &self.inner.graph,
            self.inner.options.backoff.resolve(&self.inner.graph),
        );

        let mut attempt = retries.get(&node.id).copied().unwrap_or(0) + 1;
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(AttractorError::Canceled(self.cancel_cause()));
            }

            self.sink().emit(
                ProgressEvent::new(EVENT_STAGE_ATTEMPT_START)
                    .node(&node.id)
                    .attempt(attempt)
                    .field("max_attempts", policy.max_attempts),
            );

            let stage_logs_dir = stage_dir(&self.inner.logs_root, &node.id);
            ensure_dir(&stage_logs_dir)?;
            // A stale canonical status from an earlier attempt must not be
            // mistaken for this attempt's result.
            let _ = std::fs::remove_file(stage_logs_dir.join("status.json"));
            let exec = Execution {
                engine: self.clone(),
                attempt,
                stage_logs_dir: stage_logs_dir.clone(),
                worktree_dir: self.inner.worktree_dir.clone(),
                cancel: self.inner.cancel.clone(),
            };

            let heartbeat = self.start_heartbeat(&node.id, attempt);
            let result = handler.execute(&exec, node).await;
            heartbeat.stop().await;

            let outcome = match result {
                Ok(outcome) => outcome.normalized(),
                Err(error) => {
                    self.sink().emit(
                        ProgressEvent::new(EVENT_STAGE_ATTEMPT_END)
                            .node(&node.id)
                            .attempt(attempt)
                            .field("status", "error")
                            .field("error", error.to_string()),
                    );
                    return Err(error);
                }
            };

            crate::status::write_canonical_status(&stage_logs_dir.join("status.json"), &outcome)?;
            retries.insert(node.id.clone(), attempt);

            let mut end_event = ProgressEvent::new(EVENT_STAGE_ATTEMPT_END)
                .node(&node.id)
                .attempt(attempt)
                .field("status", outcome.status.as_str());
            if outcome.status.is_failure_like() {
                end_event = end_event
                    .field("failure_class", outcome.failure_class().as_str())
                    .field(
                        "failure_reason",
                        outcome.failure_reason.clone().unwrap_or_default(),
                    );
            }
            self.sink().emit(end_event);

            if !outcome.status.is_failure_like() || attempt >= policy.max_attempts {
                return Ok(outcome);
            }

            if !should_retry_outcome(&outcome) {
                self.sink().emit(
                    ProgressEvent::new(EVENT_STAGE_RETRY_BLOCKED)
                        .node(&node.id)
                        .attempt(attempt)
                        .field("failure_class", outcome.failure_class().as_str())
                        .field(
                            "failure_reason",
                            outcome.failure_reason.clone().unwrap_or_default(),
                        ),
                );
                return Ok(outcome);
            }

            let delay_ms = delay_for_attempt_ms(attempt, &policy.backoff);
            self.sink().emit(
                ProgressEvent::new(EVENT_STAGE_RETRY_SLEEP)
                    .node(&node.id)
                    .attempt(attempt)
                    .field("delay_ms", delay_ms)
                    .field("next_attempt", attempt + 1),
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = self.inner.cancel.cancelled() => {
                    return Err(AttractorError::Canceled(self.cancel_cause()));
                }
            }
            attempt += 1;
        }
    }

    fn start_heartbeat(&self, node_id: &str, attempt: u32) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let sink = self.sink().clone();
        let node_id = node_id.to_string();
        let interval = self.inner.options.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick carries no signal
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {
                        sink.emit(
                            ProgressEvent::new(EVENT_STAGE_HEARTBEAT)
                                .node(node_id.clone())
                                .attempt(attempt),
                        );
                    }
                }
            }
        });
        HeartbeatHandle {
            stop_tx,
            handle: Some(handle),
        }
    }

    // Checkpointing.

    async fn checkpoint(
        &self,
        node_id: &str,
        next_node: Option<&str>,
        completed: &[String],
        retries: &BTreeMap<String, u32>,
        node_outcomes: &BTreeMap<String, Outcome>,
    ) -> Result<Option<String>, AttractorError> {
        let _guard = self.inner.git_lock.lock().await;

        let git = GitWorktree::new(&self.inner.worktree_dir);
        let head_before = git.head_sha().unwrap_or(None);

        let mut checkpoint = Checkpoint {
            run_id: self.inner.run_id.clone(),
            current_node: node_id.to_string(),
            next_node: next_node.map(str::to_string),
            completed_nodes: completed.to_vec(),
            node_retries: retries.clone(),
            node_outcomes: node_outcomes.clone(),
            context: self.inner.context.snapshot(),
            head_sha: head_before.clone(),
            saved_at: chrono::Utc::now().to_rfc3339(),
        };
        checkpoint.save(&self.inner.logs_root)?;

        // The second write (with next_node resolved) records no new commit.
        if next_node.is_some() {
            return Ok(head_before);
        }

        let status = node_outcomes
            .get(node_id)
            .map(|o| o.status.as_str())
            .unwrap_or("success");
        git.add_all_excluding(&self.inner.options.checkpoint_exclude_globs)?;
        let sha = git.commit_allow_empty(&format!(
            "{}: {} {}",
            self.inner.run_id, node_id, status
        ))?;
        checkpoint.head_sha = Some(sha.clone());
        checkpoint.save(&self.inner.logs_root)?;

        self.sink().emit(
            ProgressEvent::new(EVENT_CHECKPOINT_SAVED)
                .node(node_id)
                .field("head_sha", sha.clone()),
        );
        Ok(Some(sha))
    }

    fn infer_next_from_checkpoint(&self, checkpoint: &Checkpoint) -> Option<String> {
        let node = self.inner.graph.node(&checkpoint.current_node)?;
        let outcome = checkpoint.last_outcome()?.clone();
        match self.resolve_next_hop(node, &outcome) {
            NextHop::Edge(edge) => Some(edge.to),
            NextHop::Terminal => None,
        }
    }

    // Branch engines.

    /// Derive a branch engine: fresh context fork, branch logs namespace,
    /// isolated worktree copy, tagged sink, shared graph/backend/registry,
    /// and the provided cancellation token.
    pub fn branch_engine(
        &self,
        fan_out_node: &str,
        branch_key: &str,
        cancel: CancellationToken,
    ) -> Result<Engine, AttractorError> {
        let branch_logs = branch_logs_root(&self.inner.logs_root, fan_out_node, branch_key);
        ensure_dir(&branch_logs)?;
        let branch_worktree = branch_logs.join("worktree");
        if !branch_worktree.exists() {
            copy_dir_recursive(&self.inner.worktree_dir, &branch_worktree)?;
        }

        Ok(Engine {
            inner: Arc::new(EngineInner {
                graph: self.inner.graph.clone(),
                options: self.inner.options.clone(),
                run_id: self.inner.run_id.clone(),
                logs_root: branch_logs.clone(),
                worktree_dir: branch_worktree,
                context: self.inner.context.clone_isolated(),
                registry: self.inner.registry.clone(),
                backend: self.inner.backend.clone(),
                sink: self.inner.sink.branch(branch_key, branch_logs),
                cancel,
                cancel_cause: Mutex::new(None),
                git_lock: tokio::sync::Mutex::new(()),
                finalized: Mutex::new(true), // branches never write final.json
                restart: Mutex::new(RestartState {
                    total_restarts: 0,
                    signature_counts: BTreeMap::new(),
                    cycle_counts: BTreeMap::new(),
                }),
                catalog: self.inner.catalog.clone(),
                is_branch: true,
            }),
        })
    }

    /// Branch traversal: like the main loop, but stops when the next hop
    /// would enter `stop_node` (the fan-in), never restarts, and reports
    /// rather than finalizes.
    pub async fn run_subgraph_until(
        &self,
        start_node: &str,
        stop_node: Option<&str>,
    ) -> Result<BranchRun, AttractorError> {
        debug_assert!(self.inner.is_branch);
        let mut current = start_node.to_string();
        let mut completed: Vec<String> = Vec::new();
        let mut retries: BTreeMap<String, u32> = BTreeMap::new();
        let mut node_outcomes: BTreeMap<String, Outcome> = BTreeMap::new();
        let mut visits: BTreeMap<String, u32> = BTreeMap::new();
        let mut last_node: Option<String> = None;
        let mut last_outcome: Option<Outcome> = None;

        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(AttractorError::Canceled("branch canceled".to_string()));
            }
            if stop_node == Some(current.as_str()) {
                return Ok(BranchRun {
                    last_node,
                    outcome: last_outcome,
                    completed,
                });
            }

            let node = self
                .inner
                .graph
                .node(&current)
                .ok_or_else(|| {
                    AttractorError::InvalidGraph(format!("branch reached unknown node '{current}'"))
                })?
                .clone();

            let visit_count = visits.entry(node.id.clone()).or_insert(0);
            *visit_count += 1;
            if *visit_count > self.inner.options.max_node_visits {
                let outcome = Outcome::fail(format!(
                    "branch node '{}' exceeded max_node_visits",
                    node.id
                ));
                return Ok(BranchRun {
                    last_node: Some(node.id),
                    outcome: Some(outcome),
                    completed,
                });
            }

            let outcome = self.execute_with_retry(&node, &mut retries).await?;
            completed.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.clone());
            self.inner.context.apply_outcome(&node.id, &outcome);
            self.checkpoint(&node.id, None, &completed, &retries, &node_outcomes)
                .await?;

            last_node = Some(node.id.clone());
            last_outcome = Some(outcome.clone());

            let next = match self.resolve_next_hop(&node, &outcome) {
                NextHop::Terminal => {
                    return Ok(BranchRun {
                        last_node,
                        outcome: last_outcome,
                        completed,
                    });
                }
                NextHop::Edge(edge) => edge,
            };
            if next.is_loop_restart() {
                return Err(AttractorError::Runtime(
                    "loop_restart is not supported inside parallel branches".to_string(),
                ));
            }
            if stop_node == Some(next.to.as_str()) {
                return Ok(BranchRun {
                    last_node,
                    outcome: last_outcome,
                    completed,
                });
            }

            // Branch-local deterministic cycle breaker, symmetric with the
            // main loop.
            if outcome.status.is_failure_like()
                && outcome.failure_class() == FailureClass::Deterministic
                && completed.contains(&next.to)
            {
                let signature = failure_signature(&node.id, &outcome);
                let count = {
                    let mut restart =
                        self.inner.restart.lock().unwrap_or_else(|e| e.into_inner());
                    let count = restart.cycle_counts.entry(signature.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if count >= self.inner.options.deterministic_cycle_limit {
                    self.sink().emit(
                        ProgressEvent::new(EVENT_CYCLE_BREAK)
                            .node(&node.id)
                            .field("signature", signature.clone())
                            .field("count", count),
                    );
                    return Ok(BranchRun {
                        last_node: Some(node.id.clone()),
                        outcome: Some(Outcome::fail(format!(
                            "deterministic failure cycle detected in branch at '{}'",
                            node.id
                        ))),
                        completed,
                    });
                }
            }

            current = next.to;
        }
    }

    // Finalization.

    fn conclude(
        &self,
        outcome: Result<(Outcome, Vec<String>), AttractorError>,
    ) -> Result<RunResult, AttractorError> {
        match outcome {
            Ok((outcome, completed)) => {
                let final_outcome = if outcome.status.is_success_like()
                    || outcome.status == OutcomeStatus::Skipped
                {
                    self.finalize_success()
                } else {
                    self.finalize_fail(
                        outcome
                            .failure_reason
                            .as_deref()
                            .unwrap_or("unspecified failure"),
                        "traversal",
                    )
                };
                Ok(self.run_result(final_outcome, completed))
            }
            Err(AttractorError::Canceled(reason)) => {
                // Prefer the recorded cancellation cause (e.g. the stall
                // watchdog) over the point-of-interruption message.
                let cause = self
                    .inner
                    .cancel_cause
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or(reason);
                let final_outcome = self.finalize_fail(&cause, "canceled");
                Ok(self.run_result(final_outcome, Vec::new()))
            }
            Err(error) => {
                self.finalize_fail(&error.to_string(), "fatal");
                Err(error)
            }
        }
    }

    fn finalize_success(&self) -> FinalOutcome {
        self.finalize(FinalOutcome::success(self.inner.run_id.clone()))
    }

    fn finalize_fail(&self, reason: &str, cause: &str) -> FinalOutcome {
        self.finalize(FinalOutcome::fail(
            self.inner.run_id.clone(),
            reason,
            Some(cause.to_string()),
        ))
    }

    /// Idempotent terminal persistence: `final.json`, the run marker event,
    /// and a best-effort logs archive. Only the first caller wins.
    fn finalize(&self, outcome: FinalOutcome) -> FinalOutcome {
        {
            let mut finalized = self
                .inner
                .finalized
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if *finalized {
                return read_final(&self.inner.logs_root).unwrap_or(outcome);
            }
            *finalized = true;
        }

        if let Err(error) = write_final(&self.inner.logs_root, &outcome) {
            warn!(%error, "failed writing final.json");
        }
        let marker = if outcome.is_fail() {
            ProgressEvent::new(EVENT_RUN_FAILED).field(
                "failure_reason",
                outcome.failure_reason.clone().unwrap_or_default(),
            )
        } else {
            ProgressEvent::new(EVENT_RUN_COMPLETED)
        };
        self.sink().emit(marker);
        self.inner.cancel.cancel();

        if let Err(error) = artifacts::archive_logs(&self.inner.logs_root) {
            debug!(%error, "logs archive skipped");
        }
        info!(run_id = %self.inner.run_id, status = %outcome.status, "run finalized");
        outcome
    }

    fn run_result(&self, final_outcome: FinalOutcome, completed: Vec<String>) -> RunResult {
        RunResult {
            run_id: self.inner.run_id.clone(),
            final_outcome,
            completed_nodes: completed,
            logs_root: self.inner.logs_root.clone(),
            worktree_dir: self.inner.worktree_dir.clone(),
        }
    }
}

struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Stop the heartbeat deterministically: signal, then join, so no
    /// heartbeat can be emitted after the attempt's end event.
    async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Graph-level `restart_signature_limit`, `max_restarts`, `max_node_visits`
/// and `runtime_policy.*` attributes override the configured defaults.
fn resolve_graph_policy_overrides(mut options: RunOptions, graph: &Graph) -> RunOptions {
    if let Some(limit) = graph.attrs.get_u64("restart_signature_limit") {
        options.restart_signature_limit = limit as u32;
    }
    if let Some(max) = graph.attrs.get_u64("max_restarts") {
        options.max_restarts = max as u32;
    }
    if let Some(max) = graph.attrs.get_u64("max_node_visits") {
        options.max_node_visits = max as u32;
    }
    if let Some(globs) = graph.attrs.get_str("checkpoint_exclude_globs") {
        let globs: Vec<String> = globs
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();
        if !globs.is_empty() {
            options.checkpoint_exclude_globs = globs;
        }
    }
    if let Some(enabled) = graph
        .attrs
        .get_bool("runtime_policy.agent_turn_auto_extend_enabled")
    {
        options.turn_budget.auto_extend_enabled = enabled;
    }
    if let Some(multiplier) = graph.attrs.get_u64("runtime_policy.turn_budget_multiplier") {
        options.turn_budget.multiplier = multiplier as u32;
    }
    if let Some(max) = graph.attrs.get_u64("runtime_policy.max_extensions") {
        options.turn_budget.max_extensions = max as u32;
    }
    options
}
