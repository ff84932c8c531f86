use crate::errors::AttractorError;
use crate::fsutil::atomic_write_json;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const FINAL_FILE: &str = "final.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const PROGRESS_FILE: &str = "progress.ndjson";
pub const LIVE_FILE: &str = "live.json";
pub const PID_FILE: &str = "run.pid";
pub const GRAPH_FILE: &str = "graph.dot";
pub const PREFLIGHT_REPORT_FILE: &str = "preflight_report.json";
pub const STATUS_FILE: &str = "status.json";
pub const MODELDB_SNAPSHOT: &str = "modeldb/openrouter_models.json";
pub const RUN_ARCHIVE: &str = "run.tgz";

pub fn stage_dir(logs_root: &Path, node_id: &str) -> PathBuf {
    logs_root.join(node_id)
}

pub fn stage_status_path(logs_root: &Path, node_id: &str) -> PathBuf {
    stage_dir(logs_root, node_id).join(STATUS_FILE)
}

pub fn branch_logs_root(logs_root: &Path, fan_out_node: &str, branch_key: &str) -> PathBuf {
    logs_root.join(fan_out_node).join(branch_key)
}

/// Immutable run metadata written once at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub graph_id: String,
    pub created_at: String,
    pub logs_root: String,
    pub worktree_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    pub pid: u32,
}

/// Terminal outcome document. Written exactly once per run on every
/// controllable exit path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalOutcome {
    pub status: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub ended_at: String,
}

impl FinalOutcome {
    pub fn success(run_id: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            run_id: run_id.into(),
            failure_reason: None,
            cause: None,
            ended_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn fail(
        run_id: impl Into<String>,
        failure_reason: impl Into<String>,
        cause: Option<String>,
    ) -> Self {
        Self {
            status: "fail".to_string(),
            run_id: run_id.into(),
            failure_reason: Some(failure_reason.into()),
            cause,
            ended_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_fail(&self) -> bool {
        self.status == "fail"
    }
}

pub fn write_final(logs_root: &Path, outcome: &FinalOutcome) -> Result<(), AttractorError> {
    atomic_write_json(&logs_root.join(FINAL_FILE), outcome)
}

pub fn read_final(logs_root: &Path) -> Option<FinalOutcome> {
    crate::fsutil::read_json(&logs_root.join(FINAL_FILE)).ok()
}

pub fn write_manifest(logs_root: &Path, manifest: &RunManifest) -> Result<(), AttractorError> {
    atomic_write_json(&logs_root.join(MANIFEST_FILE), manifest)
}

pub fn read_manifest(logs_root: &Path) -> Result<RunManifest, AttractorError> {
    crate::fsutil::read_json(&logs_root.join(MANIFEST_FILE))
}

/// Best-effort gzip'd tar of the logs directory, written inside it. The
/// archive itself and the transient live.json are skipped.
pub fn archive_logs(logs_root: &Path) -> Result<PathBuf, AttractorError> {
    let archive_path = logs_root.join(RUN_ARCHIVE);
    let file = File::create(&archive_path).map_err(|error| AttractorError::io(&archive_path, error))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_dir_filtered(&mut builder, logs_root, logs_root)?;

    let encoder = builder
        .into_inner()
        .map_err(|error| AttractorError::io(&archive_path, error))?;
    encoder
        .finish()
        .map_err(|error| AttractorError::io(&archive_path, error))?;
    Ok(archive_path)
}

fn append_dir_filtered(
    builder: &mut tar::Builder<GzEncoder<File>>,
    root: &Path,
    dir: &Path,
) -> Result<(), AttractorError> {
    let entries = std::fs::read_dir(dir).map_err(|error| AttractorError::io(dir, error))?;
    for entry in entries {
        let entry = entry.map_err(|error| AttractorError::io(dir, error))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if dir == root && (name == RUN_ARCHIVE || name == LIVE_FILE) {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|_| AttractorError::Runtime(format!("path escape in {}", path.display())))?
            .to_path_buf();
        if path.is_dir() {
            append_dir_filtered(builder, root, &path)?;
        } else if path.is_file() {
            builder
                .append_path_with_name(&path, &rel)
                .map_err(|error| AttractorError::io(&path, error))?;
        }
    }
    Ok(())
}
