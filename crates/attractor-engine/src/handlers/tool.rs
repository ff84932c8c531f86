use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::fsutil::{atomic_write_json, ensure_dir};
use crate::graph::Node;
use crate::handlers::NodeHandler;
use crate::node_env::NodeEnvironment;
use crate::outcome::Outcome;
use crate::parse::parse_duration_ms;
use crate::procutil::{set_process_group, terminate_process_group};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_TOOL_TIMEOUT_MS: u64 = 10 * 60 * 1_000;
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct ToolInvocationRecord {
    tool_command: String,
    env_mode: String,
    exit_code: Option<i32>,
    duration_ms: u64,
    timed_out: bool,
}

/// Deterministic command stage: `bash -c <tool_command>` in the worktree
/// with the base node environment, own process group, stdio captured to the
/// stage logs. Success iff exit code 0; any non-zero exit is a
/// deterministic failure.
#[derive(Debug, Default)]
pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    async fn execute(&self, exec: &Execution, node: &Node) -> Result<Outcome, AttractorError> {
        let command = node
            .attrs
            .get_str("tool_command")
            .unwrap_or_default()
            .trim()
            .to_string();
        if command.is_empty() {
            return Ok(Outcome::fail(format!(
                "tool node '{}' has no tool_command",
                node.id
            )));
        }

        ensure_dir(&exec.stage_logs_dir)?;
        let stdout_file = std::fs::File::create(exec.stage_logs_dir.join("stdout.log"))
            .map_err(|error| AttractorError::io(exec.stage_logs_dir.join("stdout.log"), error))?;
        let stderr_file = std::fs::File::create(exec.stage_logs_dir.join("stderr.log"))
            .map_err(|error| AttractorError::io(exec.stage_logs_dir.join("stderr.log"), error))?;

        let env = NodeEnvironment::base(&exec.worktree_dir, &exec.stage_logs_dir, &[]);
        let timeout_ms = node
            .attrs
            .get_str("timeout")
            .and_then(parse_duration_ms)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT_MS);

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&exec.worktree_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));
        env.apply_to(&mut cmd);
        set_process_group(&mut cmd);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|error| AttractorError::Runtime(format!("spawn bash for '{command}': {error}")))?;

        enum WaitEnd {
            Exited(Option<i32>),
            TimedOut,
            Canceled,
        }
        let end = tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|error| AttractorError::Runtime(format!("wait on tool: {error}")))?;
                WaitEnd::Exited(status.code())
            }
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => WaitEnd::TimedOut,
            _ = exec.cancel.cancelled() => WaitEnd::Canceled,
        };
        let (exit_code, timed_out) = match end {
            WaitEnd::Exited(code) => (code, false),
            WaitEnd::TimedOut => {
                terminate_process_group(&mut child, TERMINATE_GRACE).await;
                (None, true)
            }
            WaitEnd::Canceled => {
                terminate_process_group(&mut child, TERMINATE_GRACE).await;
                return Err(AttractorError::Canceled("tool stage canceled".to_string()));
            }
        };

        let record = ToolInvocationRecord {
            tool_command: command.clone(),
            env_mode: "base".to_string(),
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
        };
        atomic_write_json(&exec.stage_logs_dir.join("tool_invocation.json"), &record)?;
        debug!(node = %node.id, ?exit_code, timed_out, "tool stage finished");

        if timed_out {
            return Ok(Outcome::fail(format!(
                "tool command timed out after {timeout_ms}ms"
            ))
            .with_class(crate::failure::FailureClass::TransientInfra)
            .with_signature(format!("tool_timeout|{}", node.id)));
        }

        match exit_code {
            Some(0) => Ok(Outcome::success()),
            Some(code) => Ok(Outcome::fail(format!(
                "tool command exited with code {code}"
            ))),
            None => Ok(Outcome::fail("tool command terminated by signal")),
        }
    }
}
