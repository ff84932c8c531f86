use crate::context::ContextValues;
use crate::errors::AttractorError;
use crate::fsutil::{atomic_write_json, read_json};
use crate::outcome::Outcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Crash-safe snapshot of run progress, written atomically after every
/// completed node and again once the next hop is known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// The node that just completed.
    pub current_node: String,
    /// The node traversal will execute next, once resolved. `None` either
    /// means the run terminated here or the hop was not yet selected when
    /// the process died; resume re-resolves it from the stored outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, Outcome>,
    pub context: ContextValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
    pub saved_at: String,
}

impl Checkpoint {
    pub fn save(&self, logs_root: &Path) -> Result<(), AttractorError> {
        atomic_write_json(&checkpoint_path(logs_root), self)
    }

    pub fn load(logs_root: &Path) -> Result<Self, AttractorError> {
        read_json(&checkpoint_path(logs_root))
    }

    pub fn exists(logs_root: &Path) -> bool {
        checkpoint_path(logs_root).exists()
    }

    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.node_outcomes.get(&self.current_node)
    }
}

pub fn checkpoint_path(logs_root: &Path) -> PathBuf {
    logs_root.join(crate::artifacts::CHECKPOINT_FILE)
}
