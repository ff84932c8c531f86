use crate::backends::CodergenBackend;
use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::failure::classify_provider_failure;
use crate::fsutil::{atomic_write_json, ensure_dir};
use crate::graph::Node;
use crate::node_env::{NodeEnvironment, STAGE_STATUS_FALLBACK_PATH_VAR, STAGE_STATUS_PATH_VAR};
use crate::outcome::Outcome;
use crate::procutil::{set_process_group, terminate_process_group};
use crate::status::{StatusIngestion, StatusSource};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const DEFAULT_STAGE_TIMEOUT_MS: u64 = 30 * 60 * 1_000;
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Fully resolved provider invocation: executable, argv, and environment
/// adjustments mandated by the provider contract.
#[derive(Clone, Debug)]
pub struct ProviderCommand {
    pub executable: String,
    pub args: Vec<String>,
    pub isolate_home: bool,
}

impl ProviderCommand {
    /// Build the per-provider command line.
    ///
    /// - openai (codex): non-interactive `exec` with JSON output, a
    ///   workspace-write sandbox, explicit model and working directory. The
    ///   deprecated approval flag is never passed.
    /// - anthropic (claude): print mode with stream-json output (which
    ///   requires `--verbose`) and a disallow-list for write tools.
    /// - google (gemini): prompt mode with the non-interactive approval
    ///   flag and an explicit model.
    pub fn for_provider(
        provider: &str,
        model: &str,
        worktree_dir: &Path,
        prompt: &str,
        max_turns: u32,
        executable_override: Option<&str>,
    ) -> Result<Self, AttractorError> {
        match provider {
            "openai" => Ok(Self {
                executable: executable_override.unwrap_or("codex").to_string(),
                args: vec![
                    "exec".to_string(),
                    "--json".to_string(),
                    "--sandbox".to_string(),
                    "workspace-write".to_string(),
                    "--model".to_string(),
                    model.to_string(),
                    "--cd".to_string(),
                    worktree_dir.display().to_string(),
                    "--skip-git-repo-check".to_string(),
                    prompt.to_string(),
                ],
                isolate_home: true,
            }),
            "anthropic" => Ok(Self {
                executable: executable_override.unwrap_or("claude").to_string(),
                args: vec![
                    "-p".to_string(),
                    "--verbose".to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--model".to_string(),
                    model.to_string(),
                    "--max-turns".to_string(),
                    max_turns.to_string(),
                    "--dangerously-skip-permissions".to_string(),
                    "--disallowedTools".to_string(),
                    "Write,Edit,NotebookEdit".to_string(),
                    prompt.to_string(),
                ],
                isolate_home: false,
            }),
            "google" => Ok(Self {
                executable: executable_override.unwrap_or("gemini").to_string(),
                args: vec![
                    "-p".to_string(),
                    prompt.to_string(),
                    "--yolo".to_string(),
                    "--model".to_string(),
                    model.to_string(),
                ],
                isolate_home: false,
            }),
            other => Err(AttractorError::Runtime(format!(
                "no CLI contract for provider '{other}'"
            ))),
        }
    }
}

#[derive(Serialize)]
struct CliInvocationRecord {
    executable: String,
    args: Vec<String>,
    env_mode: String,
    env_path_overrides: BTreeMap<String, String>,
    status_path: String,
    status_fallback_path: String,
    exit_code: Option<i32>,
    duration_ms: u64,
    timed_out: bool,
}

/// Codergen backend that drives provider CLIs as subprocesses. Each
/// invocation runs in its own process group inside the stage worktree,
/// captures stdio to the stage logs, and resolves the stage outcome through
/// status ingestion. Status fallback locations come from the run options,
/// so the exported contract paths and ingestion always agree with the
/// prompt preamble.
#[derive(Default)]
pub struct CliCodergenBackend {
    executable_overrides: BTreeMap<String, String>,
    strip_env_keys: Vec<String>,
}

impl CliCodergenBackend {
    pub fn new(executable_overrides: BTreeMap<String, String>, strip_env_keys: Vec<String>) -> Self {
        Self {
            executable_overrides,
            strip_env_keys,
        }
    }
}

#[async_trait]
impl CodergenBackend for CliCodergenBackend {
    async fn run(
        &self,
        exec: &Execution,
        node: &Node,
        prompt: &str,
        provider: &str,
        model: &str,
    ) -> Result<Outcome, AttractorError> {
        let max_turns = node
            .attrs
            .get_u64("max_agent_turns")
            .map(|v| v as u32)
            .unwrap_or(exec.engine.options().default_max_agent_turns);

        let command = ProviderCommand::for_provider(
            provider,
            model,
            &exec.worktree_dir,
            prompt,
            max_turns,
            self.executable_overrides.get(provider).map(String::as_str),
        )?;

        let options = exec.engine.options();
        let fallback_paths = options.status_fallback_paths(&exec.worktree_dir);
        let primary_fallback = options.primary_status_fallback(&exec.worktree_dir);

        let mut env =
            NodeEnvironment::base(&exec.worktree_dir, &exec.stage_logs_dir, &self.strip_env_keys);
        env.set(
            STAGE_STATUS_FALLBACK_PATH_VAR,
            primary_fallback.display().to_string(),
        );
        if command.isolate_home {
            let isolated = exec.stage_logs_dir.join("home");
            ensure_dir(&isolated)?;
            env.isolate_home(&isolated);
        }

        let timeout_ms = node
            .attrs
            .get_str("timeout")
            .and_then(crate::parse::parse_duration_ms)
            .unwrap_or(DEFAULT_STAGE_TIMEOUT_MS);

        let started = Instant::now();
        let spawn = spawn_and_capture(
            &command,
            &env,
            exec,
            Duration::from_millis(timeout_ms),
        )
        .await?;

        let record = CliInvocationRecord {
            executable: command.executable.clone(),
            args: redact_args(&command.args),
            env_mode: if command.isolate_home {
                "isolated_home".to_string()
            } else {
                "base".to_string()
            },
            env_path_overrides: env.path_overrides.clone(),
            status_path: env.get(STAGE_STATUS_PATH_VAR).unwrap_or_default().to_string(),
            status_fallback_path: primary_fallback.display().to_string(),
            exit_code: spawn.exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out: spawn.timed_out,
        };
        atomic_write_json(&exec.stage_logs_dir.join("cli_invocation.json"), &record)?;

        let ingestion = StatusIngestion {
            canonical_path: exec.stage_logs_dir.join("status.json"),
            fallback_paths,
            run_id: exec.engine.run_id(),
            node_id: &node.id,
        };
        let (outcome, source) = ingestion.resolve(exec.engine.sink())?;

        if let Some(outcome) = outcome {
            debug!(node = %node.id, ?source, "stage status resolved");
            return Ok(outcome);
        }
        debug_assert_eq!(source, StatusSource::Missing);

        if spawn.timed_out {
            return Ok(Outcome::fail(format!(
                "provider '{provider}' timed out after {timeout_ms}ms"
            ))
            .with_class(crate::failure::FailureClass::TransientInfra)
            .with_signature(format!("provider_timeout|{provider}")));
        }

        if spawn.exit_code == Some(0) {
            // Clean exit with no status payload anywhere. `auto_status`
            // nodes take the exit code as their outcome; everyone else
            // broke the status contract.
            if node.attrs.get_bool("auto_status") == Some(true) {
                return Ok(Outcome::success());
            }
            return Ok(Outcome::fail(format!(
                "provider '{provider}' exited 0 but wrote no status.json"
            )));
        }

        let stderr_tail = read_tail(&exec.stage_logs_dir.join("stderr.log"), 8 * 1024);
        let verdict = classify_provider_failure(provider, &stderr_tail, spawn.process_error.as_deref());
        warn!(node = %node.id, provider, class = verdict.class.as_str(), "provider invocation failed");
        let mut outcome = Outcome::fail(verdict.reason.clone())
            .with_class(verdict.class)
            .with_signature(verdict.signature.clone());
        if let Some(code) = verdict.code.clone() {
            outcome = outcome.with_code(code);
        }
        Ok(outcome)
    }
}

struct SpawnResult {
    exit_code: Option<i32>,
    timed_out: bool,
    process_error: Option<String>,
}

async fn spawn_and_capture(
    command: &ProviderCommand,
    env: &NodeEnvironment,
    exec: &Execution,
    timeout: Duration,
) -> Result<SpawnResult, AttractorError> {
    ensure_dir(&exec.stage_logs_dir)?;
    let stdout_file = std::fs::File::create(exec.stage_logs_dir.join("stdout.log"))
        .map_err(|error| AttractorError::io(exec.stage_logs_dir.join("stdout.log"), error))?;
    let stderr_file = std::fs::File::create(exec.stage_logs_dir.join("stderr.log"))
        .map_err(|error| AttractorError::io(exec.stage_logs_dir.join("stderr.log"), error))?;

    let mut cmd = tokio::process::Command::new(&command.executable);
    cmd.args(&command.args)
        .current_dir(&exec.worktree_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));
    env.apply_to(&mut cmd);
    set_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => {
            return Ok(SpawnResult {
                exit_code: None,
                timed_out: false,
                process_error: Some(format!("spawn {}: {error}", command.executable)),
            });
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.shutdown().await;
    }

    enum WaitEnd {
        Exited(Option<i32>),
        TimedOut,
        Canceled,
    }
    let end = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|error| {
                AttractorError::Runtime(format!("wait on {}: {error}", command.executable))
            })?;
            WaitEnd::Exited(status.code())
        }
        _ = tokio::time::sleep(timeout) => WaitEnd::TimedOut,
        _ = exec.cancel.cancelled() => WaitEnd::Canceled,
    };
    match end {
        WaitEnd::Exited(exit_code) => Ok(SpawnResult {
            exit_code,
            timed_out: false,
            process_error: None,
        }),
        WaitEnd::TimedOut => {
            terminate_process_group(&mut child, TERMINATE_GRACE).await;
            Ok(SpawnResult {
                exit_code: None,
                timed_out: true,
                process_error: Some("stage timeout".to_string()),
            })
        }
        WaitEnd::Canceled => {
            terminate_process_group(&mut child, TERMINATE_GRACE).await;
            Err(AttractorError::Canceled(
                "stage subprocess canceled".to_string(),
            ))
        }
    }
}

fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            out.push("<redacted>".to_string());
            redact_next = false;
            continue;
        }
        let lowered = arg.to_ascii_lowercase();
        if lowered.contains("api-key") || lowered.contains("api_key") || lowered.contains("token") {
            redact_next = lowered.starts_with("--") && !lowered.contains('=');
            out.push(if redact_next {
                arg.clone()
            } else {
                "<redacted>".to_string()
            });
            continue;
        }
        if arg.starts_with("sk-") {
            out.push("<redacted>".to_string());
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn read_tail(path: &Path, max_bytes: usize) -> String {
    let Ok(raw) = std::fs::read(path) else {
        return String::new();
    };
    let start = raw.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&raw[start..]).to_string()
}
