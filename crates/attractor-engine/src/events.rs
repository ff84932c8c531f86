use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

pub const EVENT_RUN_STARTED: &str = "run_started";
pub const EVENT_RUN_COMPLETED: &str = "run_completed";
pub const EVENT_RUN_FAILED: &str = "run_failed";
pub const EVENT_STAGE_ATTEMPT_START: &str = "stage_attempt_start";
pub const EVENT_STAGE_ATTEMPT_END: &str = "stage_attempt_end";
pub const EVENT_STAGE_HEARTBEAT: &str = "stage_heartbeat";
pub const EVENT_STAGE_RETRY_SLEEP: &str = "stage_retry_sleep";
pub const EVENT_STAGE_RETRY_BLOCKED: &str = "stage_retry_blocked";
pub const EVENT_STATUS_INGESTION_DECISION: &str = "status_ingestion_decision";
pub const EVENT_TURN_BUDGET_EXTENDED: &str = "turn_budget_extended";
pub const EVENT_LOOP_RESTART: &str = "loop_restart";
pub const EVENT_LOOP_RESTART_BLOCKED: &str = "loop_restart_blocked";
pub const EVENT_CYCLE_BREAK: &str = "cycle_break";
pub const EVENT_CHECKPOINT_SAVED: &str = "checkpoint_saved";
pub const EVENT_TRAVERSAL_CANCELED: &str = "traversal_canceled";
pub const EVENT_PREFLIGHT_COMPLETED: &str = "preflight_completed";
pub const EVENT_BRANCH_STARTED: &str = "branch_started";
pub const EVENT_BRANCH_COMPLETED: &str = "branch_completed";

/// One progress record. Serialized flat into `progress.ndjson`; `fields`
/// carries event-specific keys alongside the common envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_logs_root: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl ProgressEvent {
    pub fn new(event: &str) -> Self {
        Self {
            event: event.to_string(),
            ts: None,
            run_id: None,
            node_id: None,
            attempt: None,
            branch_key: None,
            branch_logs_root: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Forwarding target for events emitted by an engine: the run's own
/// `progress.ndjson`/`live.json`, the parent sink for branch engines, and an
/// optional external event-store channel. Emission is best-effort and never
/// fails the run.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    run_id: String,
    logs_root: Option<PathBuf>,
    branch_key: Option<String>,
    parent: Option<ProgressSink>,
    store_tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    state: Mutex<SinkState>,
}

struct SinkState {
    last_progress_at: Instant,
}

impl ProgressSink {
    pub fn new(run_id: impl Into<String>, logs_root: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                run_id: run_id.into(),
                logs_root,
                branch_key: None,
                parent: None,
                store_tx: None,
                state: Mutex::new(SinkState {
                    last_progress_at: Instant::now(),
                }),
            }),
        }
    }

    pub fn with_store_sender(self, store_tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        let inner = self.inner;
        Self {
            inner: Arc::new(SinkInner {
                run_id: inner.run_id.clone(),
                logs_root: inner.logs_root.clone(),
                branch_key: inner.branch_key.clone(),
                parent: inner.parent.clone(),
                store_tx: Some(store_tx),
                state: Mutex::new(SinkState {
                    last_progress_at: Instant::now(),
                }),
            }),
        }
    }

    /// Child sink for a branch engine. Events written by the child land in
    /// the branch's own logs root and are forwarded to the parent tagged
    /// with the branch key, which resets parent liveness.
    pub fn branch(&self, branch_key: impl Into<String>, branch_logs_root: PathBuf) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                run_id: self.inner.run_id.clone(),
                logs_root: Some(branch_logs_root),
                branch_key: Some(branch_key.into()),
                parent: Some(self.clone()),
                store_tx: None,
                state: Mutex::new(SinkState {
                    last_progress_at: Instant::now(),
                }),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, mut event: ProgressEvent) {
        if event.ts.is_none() {
            event.ts = Some(chrono::Utc::now().to_rfc3339());
        }
        if event.run_id.is_none() {
            event.run_id = Some(self.inner.run_id.clone());
        }
        self.record(&event);

        if let Some(parent) = self.inner.parent.as_ref() {
            let mut forwarded = event.clone();
            if forwarded.branch_key.is_none() {
                forwarded.branch_key = self.inner.branch_key.clone();
                forwarded.branch_logs_root = self
                    .inner
                    .logs_root
                    .as_ref()
                    .map(|p| p.display().to_string());
            }
            parent.forward(forwarded);
        }
    }

    fn forward(&self, event: ProgressEvent) {
        self.record(&event);
        if let Some(parent) = self.inner.parent.as_ref() {
            parent.forward(event);
        }
    }

    fn record(&self, event: &ProgressEvent) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.last_progress_at = Instant::now();
            if let Some(root) = self.inner.logs_root.as_ref() {
                write_event_files(root, event);
            }
        }
        if let Some(tx) = self.inner.store_tx.as_ref() {
            let _ = tx.send(event.clone());
        }
    }

    /// Elapsed time since the most recent event observed by this sink,
    /// including forwarded branch events. The stall watchdog polls this.
    pub fn idle_for(&self) -> std::time::Duration {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_progress_at.elapsed()
    }

    pub fn touch(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_progress_at = Instant::now();
    }
}

// Open, append, close per event so records survive abrupt process
// termination.
fn write_event_files(root: &Path, event: &ProgressEvent) {
    let Ok(mut line) = serde_json::to_vec(event) else {
        return;
    };
    line.push(b'\n');

    if std::fs::create_dir_all(root).is_err() {
        return;
    }
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join("progress.ndjson"))
    {
        let _ = file.write_all(&line);
    }
    let _ = std::fs::write(root.join("live.json"), &line);
}

/// Read every event from a `progress.ndjson` file. Used by the runstate
/// snapshot and by tests.
pub fn read_progress_events(path: &Path) -> Vec<ProgressEvent> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
