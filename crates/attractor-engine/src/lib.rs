//! Execution kernel for the Attractor pipeline engine.
//!
//! Executes a directed graph of work units: deterministic tool commands,
//! LLM codergen sessions, routing conditionals, and parallel fan-out /
//! fan-in, with deterministic routing, class-gated retry and restart
//! policy, stall detection, and crash-safe run artifacts.

pub mod artifacts;
pub mod backends;
pub mod checkpoint;
pub mod condition;
pub mod context;
pub mod engine;
pub mod errors;
pub mod events;
pub mod failure;
pub mod fsutil;
pub mod gitutil;
pub mod graph;
pub mod handlers;
pub mod modeldb;
pub mod node_env;
pub mod outcome;
pub mod parse;
pub mod preflight;
pub mod procutil;
pub mod retry;
pub mod runstate;
pub mod status;
pub mod store;
pub mod stylesheet;
pub mod validate;

pub use artifacts::{FinalOutcome, RunManifest};
pub use backends::{
    AgentLoopBackend, AgentSession, AgentSessionFactory, CliCodergenBackend, CodergenBackend,
    SharedCodergenBackend, SimulatedCodergenBackend, TurnBudgetPolicy, TurnResult,
};
pub use checkpoint::Checkpoint;
pub use condition::{evaluate_condition, validate_condition, Condition};
pub use context::{ContextStore, ContextValues};
pub use engine::{BranchRun, Engine, EngineConfig, Execution, RunOptions, RunResult};
pub use errors::{AttractorError, ValidationError};
pub use events::{ProgressEvent, ProgressSink};
pub use failure::{classify_provider_failure, failure_signature, Classification, FailureClass};
pub use graph::{AttrValue, Attributes, Edge, Graph, Node, NodeType};
pub use handlers::{core_registry, HandlerRegistry, NodeHandler, SharedNodeHandler};
pub use modeldb::{CatalogSnapshot, ModelCatalog};
pub use outcome::{Outcome, OutcomeStatus};
pub use parse::parse_dot;
pub use preflight::{PreflightMode, PreflightReport, ProbeError, PromptProber};
pub use retry::{RetryBackoffConfig, RetryPolicy};
pub use runstate::{load_snapshot, RunState, Snapshot};
pub use store::{EventStoreSink, SharedEventStoreSink};
pub use validate::{validate_graph, validate_or_raise, Diagnostic, Severity};
