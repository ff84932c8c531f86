use crate::artifacts::PREFLIGHT_REPORT_FILE;
use crate::backends::cli::ProviderCommand;
use crate::engine::Engine;
use crate::errors::AttractorError;
use crate::fsutil::atomic_write_json;
use crate::procutil::{set_process_group, terminate_process_group};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Emergency rollback switch: capability probes are skipped while
/// executable existence checks stay on.
pub const ROLLBACK_ENV_VAR: &str = "ATTRACTOR_PREFLIGHT_EXISTENCE_ONLY";

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const API_PROBE_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightMode {
    /// Existence checks plus capability probes.
    Full,
    /// Executable existence only.
    ExistenceOnly,
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
    pub pass_count: usize,
    pub warn_count: usize,
    pub fail_count: usize,
}

impl PreflightReport {
    fn push(&mut self, name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) {
        match status {
            CheckStatus::Pass => self.pass_count += 1,
            CheckStatus::Warn => self.warn_count += 1,
            CheckStatus::Fail => self.fail_count += 1,
        }
        self.checks.push(PreflightCheck {
            name: name.into(),
            status,
            detail: detail.into(),
        });
    }

    pub fn passed(&self) -> bool {
        self.fail_count == 0
    }

    pub fn fail_count(&self) -> usize {
        self.fail_count
    }

    pub fn warn_count(&self) -> usize {
        self.warn_count
    }

    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Error from an API prompt probe. Transient errors are retried with
/// jittered backoff; invalid-request errors are not.
#[derive(Clone, Debug)]
pub struct ProbeError {
    pub transient: bool,
    pub message: String,
}

/// Optional lightweight `complete` call per provider, supplied by the
/// caller; the engine never talks to a provider API directly.
#[async_trait]
pub trait PromptProber: Send + Sync {
    async fn probe(&self, provider: &str) -> Result<(), ProbeError>;
}

/// Validate the environment before traversal. The report is written to the
/// logs root on every outcome, pass or fail.
pub async fn run_preflight(
    engine: &Engine,
    prober: Option<Arc<dyn PromptProber>>,
) -> Result<PreflightReport, AttractorError> {
    let mut report = PreflightReport::default();
    let graph = engine.graph();
    let options = engine.options();
    let strict = options.strict_capabilities;
    let probes_enabled = options.preflight == PreflightMode::Full
        && std::env::var(ROLLBACK_ENV_VAR).map(|v| v != "1").unwrap_or(true);

    let providers = graph.referenced_providers();

    // 1. Provider backend presence: every referenced provider must have a
    // declared invocation contract.
    for provider in &providers {
        match ProviderCommand::for_provider(provider, "probe", Path::new("."), "", 1, None) {
            Ok(_) => report.push(
                format!("provider_backend:{provider}"),
                CheckStatus::Pass,
                "backend contract declared",
            ),
            Err(_) => report.push(
                format!("provider_backend:{provider}"),
                CheckStatus::Fail,
                "no backend contract for provider",
            ),
        }
    }

    // 2. Model catalog consistency.
    let pairs = graph.referenced_provider_models();
    match engine.catalog() {
        Some(catalog) => {
            for (provider, model) in &pairs {
                if catalog.has_provider_model(provider, model) {
                    report.push(
                        format!("catalog:{provider}/{model}"),
                        CheckStatus::Pass,
                        "model present in pinned catalog",
                    );
                } else {
                    report.push(
                        format!("catalog:{provider}/{model}"),
                        CheckStatus::Fail,
                        "model missing from pinned catalog snapshot",
                    );
                }
            }
        }
        None if !pairs.is_empty() => {
            report.push(
                "catalog",
                CheckStatus::Warn,
                "no catalog snapshot configured; model pins are unchecked",
            );
        }
        None => {}
    }

    // 3. CLI presence and capability probes.
    for provider in &providers {
        let command = match ProviderCommand::for_provider(provider, "probe", Path::new("."), "", 1, None)
        {
            Ok(command) => command,
            Err(_) => continue,
        };
        let Some(resolved) = find_executable(&command.executable) else {
            report.push(
                format!("cli_exists:{provider}"),
                CheckStatus::Fail,
                format!("executable '{}' not found in PATH", command.executable),
            );
            continue;
        };
        report.push(
            format!("cli_exists:{provider}"),
            CheckStatus::Pass,
            resolved.display().to_string(),
        );

        if !probes_enabled {
            continue;
        }
        match capability_probe(&resolved, required_tokens(provider)).await {
            Ok(()) => report.push(
                format!("cli_capabilities:{provider}"),
                CheckStatus::Pass,
                "required option tokens present",
            ),
            Err(detail) => {
                // strict_capabilities upgrades probe warnings to failures.
                let status = if strict { CheckStatus::Fail } else { CheckStatus::Warn };
                report.push(format!("cli_capabilities:{provider}"), status, detail);
            }
        }
    }

    // 4. API prompt probes.
    if let Some(prober) = prober {
        for provider in &providers {
            match api_probe_with_retry(prober.as_ref(), provider).await {
                Ok(()) => report.push(
                    format!("api_probe:{provider}"),
                    CheckStatus::Pass,
                    "prompt probe succeeded",
                ),
                Err(error) => report.push(
                    format!("api_probe:{provider}"),
                    CheckStatus::Fail,
                    error.message,
                ),
            }
        }
    }

    atomic_write_json(&engine.logs_root().join(PREFLIGHT_REPORT_FILE), &report)?;
    debug!(
        pass = report.pass_count,
        warn = report.warn_count,
        fail = report.fail_count,
        "preflight finished"
    );
    Ok(report)
}

fn required_tokens(provider: &str) -> &'static [&'static str] {
    match provider {
        "openai" => &["exec", "--sandbox"],
        "anthropic" => &["--output-format", "--max-turns"],
        "google" => &["--model"],
        _ => &[],
    }
}

/// Short help invocation validating that the CLI understands the options
/// the invocation contract depends on. The probe runs in its own process
/// group and the group is terminated on timeout.
async fn capability_probe(executable: &Path, tokens: &[&str]) -> Result<(), String> {
    use tokio::io::AsyncReadExt;

    let mut cmd = tokio::process::Command::new(executable);
    cmd.arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    set_process_group(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|error| format!("spawn {} --help: {error}", executable.display()))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let reader = tokio::spawn(async move {
        let mut text = String::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_string(&mut text).await;
        }
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_string(&mut text).await;
        }
        text
    });

    let exited = tokio::select! {
        status = child.wait() => {
            status.map_err(|error| format!("probe failed: {error}"))?;
            true
        }
        _ = tokio::time::sleep(PROBE_TIMEOUT) => false,
    };
    if !exited {
        terminate_process_group(&mut child, Duration::from_secs(2)).await;
        reader.abort();
        return Err("capability probe timed out".to_string());
    }
    let help_text = reader.await.unwrap_or_default();

    let missing: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|token| !help_text.contains(token))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("help output missing tokens: {}", missing.join(", ")))
    }
}

async fn api_probe_with_retry(prober: &dyn PromptProber, provider: &str) -> Result<(), ProbeError> {
    let mut attempt = 1;
    loop {
        match prober.probe(provider).await {
            Ok(()) => return Ok(()),
            Err(error) if !error.transient => return Err(error),
            Err(error) => {
                if attempt >= API_PROBE_ATTEMPTS {
                    return Err(error);
                }
                let delay = jittered_delay_ms(provider, attempt);
                warn!(provider, attempt, delay_ms = delay, "transient API probe failure; retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

fn jittered_delay_ms(provider: &str, attempt: u32) -> u64 {
    let base = 250u64.saturating_mul(1 << attempt.min(6));
    let mut hasher = DefaultHasher::new();
    (provider, attempt).hash(&mut hasher);
    base + hasher.finish() % base.max(1)
}

fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(name);
        if is_executable(&full) {
            return Some(full);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
