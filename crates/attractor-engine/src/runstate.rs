use crate::artifacts::{FINAL_FILE, LIVE_FILE, PID_FILE, PROGRESS_FILE};
use crate::errors::AttractorError;
use crate::events::{read_progress_events, ProgressEvent};
use crate::procutil::pid_alive;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Fail,
    Unknown,
}

/// Compact view of a run's on-disk state, assembled from the logs root.
/// `final.json` is authoritative for terminal status; `live.json` and the
/// progress tail are best-effort activity feeds that never override it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: RunState,
    pub run_id: Option<String>,
    pub failure_reason: Option<String>,
    pub last_event: Option<String>,
    pub current_node: Option<String>,
    pub last_event_at: Option<String>,
    pub pid: Option<u32>,
    pub pid_alive: bool,
}

pub fn load_snapshot(logs_root: &Path) -> Result<Snapshot, AttractorError> {
    if !logs_root.exists() {
        return Err(AttractorError::Runtime(format!(
            "logs root {} does not exist",
            logs_root.display()
        )));
    }

    let mut snapshot = Snapshot {
        state: RunState::Unknown,
        run_id: None,
        failure_reason: None,
        last_event: None,
        current_node: None,
        last_event_at: None,
        pid: None,
        pid_alive: false,
    };

    if let Some(final_outcome) = crate::artifacts::read_final(logs_root) {
        snapshot.run_id = Some(final_outcome.run_id.clone());
        snapshot.state = if final_outcome.is_fail() {
            snapshot.failure_reason = final_outcome.failure_reason.clone();
            RunState::Fail
        } else {
            RunState::Success
        };
    }
    let terminal = matches!(snapshot.state, RunState::Success | RunState::Fail);

    if !terminal {
        if let Some(event) = last_event(logs_root) {
            if snapshot.run_id.is_none() {
                snapshot.run_id = event.run_id.clone();
            }
            snapshot.last_event = Some(event.event.clone());
            snapshot.current_node = event.node_id.clone();
            snapshot.last_event_at = event.ts.clone();
            if let Some(reason) = event.fields.get("failure_reason").and_then(|v| v.as_str()) {
                snapshot.failure_reason = Some(reason.to_string());
            }
        }
    }

    if let Ok(raw) = std::fs::read_to_string(logs_root.join(PID_FILE)) {
        if let Ok(pid) = raw.trim().parse::<u32>() {
            snapshot.pid = Some(pid);
            snapshot.pid_alive = pid_alive(pid);
        }
    }

    if snapshot.state == RunState::Unknown && snapshot.pid_alive {
        snapshot.state = RunState::Running;
    }

    Ok(snapshot)
}

fn last_event(logs_root: &Path) -> Option<ProgressEvent> {
    if let Ok(raw) = std::fs::read_to_string(logs_root.join(LIVE_FILE)) {
        if let Ok(event) = serde_json::from_str::<ProgressEvent>(raw.trim()) {
            return Some(event);
        }
    }
    read_progress_events(&logs_root.join(PROGRESS_FILE))
        .into_iter()
        .last()
}

/// Whether a `final.json` exists at the logs root.
pub fn is_finalized(logs_root: &Path) -> bool {
    logs_root.join(FINAL_FILE).exists()
}
