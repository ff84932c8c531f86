use anyhow::{anyhow, bail, Context, Result};
use attractor_engine::{
    load_snapshot, parse_dot, validate_graph, CliCodergenBackend, Engine, EngineConfig,
    PreflightMode, RunOptions, RunState, SimulatedCodergenBackend,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "attractor")]
#[command(about = "Graph-driven software-building pipeline engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a pipeline graph.
    Run(RunArgs),
    /// Continue a checkpointed run.
    Resume(ResumeArgs),
    /// Signal a detached run after verifying its identity.
    Stop(StopArgs),
    /// Print the run's on-disk state.
    Status(LogsRootArgs),
    /// Parse and lint a graph without executing it.
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    graph: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    logs_root: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    detach: bool,
    /// Permit the simulated in-process backend (tests and dry runs).
    #[arg(long, action = ArgAction::SetTrue)]
    allow_test_shim: bool,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    logs_root: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StopArgs {
    #[arg(long)]
    logs_root: PathBuf,
    #[arg(long, default_value_t = 5_000)]
    grace_ms: u64,
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
}

#[derive(Args, Debug)]
struct LogsRootArgs {
    #[arg(long)]
    logs_root: PathBuf,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    graph: PathBuf,
}

/// Run configuration file (JSON). Everything is optional; omitted keys use
/// engine defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    repo_path: Option<PathBuf>,
    worktree_dir: Option<PathBuf>,
    default_provider: Option<String>,
    default_model: Option<String>,
    failover: Option<Vec<String>>,
    catalog_snapshot: Option<PathBuf>,
    stall_timeout_ms: Option<u64>,
    stall_check_interval_ms: Option<u64>,
    default_max_agent_turns: Option<u32>,
    strict_capabilities: Option<bool>,
    preflight: Option<String>,
    backend: Option<String>,
    provider_executables: Option<BTreeMap<String, String>>,
    status_fallback_paths: Option<Vec<String>>,
    checkpoint_exclude_globs: Option<Vec<String>>,
    strip_env_keys: Option<Vec<String>>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => {
            if args.detach {
                return run_detached(&args);
            }
            runtime()?.block_on(run_command(args))
        }
        Commands::Resume(args) => runtime()?.block_on(resume_command(args)),
        Commands::Stop(args) => stop_command(args),
        Commands::Status(args) => status_command(args),
        Commands::Validate(args) => validate_command(args),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn load_config(path: Option<&Path>) -> Result<ConfigFile> {
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
}

fn build_options(
    config: &ConfigFile,
    run_id: Option<String>,
    logs_root: PathBuf,
) -> Result<RunOptions> {
    let mut options = RunOptions {
        run_id,
        logs_root,
        ..RunOptions::default()
    };
    options.repo_path = config.repo_path.clone();
    options.worktree_dir = config.worktree_dir.clone();
    if let Some(provider) = &config.default_provider {
        options.default_provider = provider.clone();
    }
    if let Some(model) = &config.default_model {
        options.default_model = model.clone();
    }
    options.failover_chain = config.failover.clone();
    options.catalog_snapshot = config.catalog_snapshot.clone();
    if let Some(ms) = config.stall_timeout_ms {
        options.stall_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = config.stall_check_interval_ms {
        options.stall_check_interval = Duration::from_millis(ms);
    }
    if let Some(turns) = config.default_max_agent_turns {
        options.default_max_agent_turns = turns;
    }
    if let Some(strict) = config.strict_capabilities {
        options.strict_capabilities = strict;
    }
    if let Some(globs) = &config.checkpoint_exclude_globs {
        options.checkpoint_exclude_globs = globs.clone();
    }
    if let Some(fallbacks) = &config.status_fallback_paths {
        options.status_fallback_relpaths = fallbacks.clone();
    }
    options.preflight = match config.preflight.as_deref() {
        None | Some("full") => PreflightMode::Full,
        Some("existence_only") => PreflightMode::ExistenceOnly,
        Some("skip") => PreflightMode::Skip,
        Some(other) => bail!("unknown preflight mode '{other}'"),
    };
    Ok(options)
}

fn build_engine_config(config: &ConfigFile, allow_test_shim: bool) -> Result<EngineConfig> {
    let backend_kind = config.backend.as_deref().unwrap_or("cli");
    let backend: attractor_engine::SharedCodergenBackend = match backend_kind {
        "cli" => Arc::new(CliCodergenBackend::new(
            config.provider_executables.clone().unwrap_or_default(),
            config.strip_env_keys.clone().unwrap_or_default(),
        )),
        "simulated" => {
            if !allow_test_shim {
                bail!("backend 'simulated' requires --allow-test-shim");
            }
            Arc::new(SimulatedCodergenBackend)
        }
        other => bail!("unknown backend '{other}'"),
    };
    Ok(EngineConfig {
        backend: Some(backend),
        ..EngineConfig::default()
    })
}

async fn run_command(args: RunArgs) -> Result<ExitCode> {
    let dot = std::fs::read_to_string(&args.graph)
        .with_context(|| format!("read graph {}", args.graph.display()))?;
    let graph = parse_dot(&dot).map_err(|error| anyhow!("{error}"))?;

    let config = load_config(args.config.as_deref())?;
    let options = build_options(&config, args.run_id.clone(), args.logs_root.clone())?;
    let engine_config = build_engine_config(&config, args.allow_test_shim)?;

    let result = Engine::run(graph, options, engine_config)
        .await
        .map_err(|error| anyhow!("{error}"))?;

    println!(
        "run_id={} status={} logs_root={}",
        result.run_id,
        result.final_outcome.status,
        result.logs_root.display()
    );
    if result.final_outcome.is_fail() {
        if let Some(reason) = &result.final_outcome.failure_reason {
            println!("failure_reason={reason}");
        }
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let options = build_options(&config, None, args.logs_root.clone())?;
    let engine_config = build_engine_config(&config, true)?;

    let result = Engine::resume(&args.logs_root, options, engine_config)
        .await
        .map_err(|error| anyhow!("{error}"))?;

    println!(
        "run_id={} status={}",
        result.run_id, result.final_outcome.status
    );
    if result.final_outcome.is_fail() {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

/// Re-exec the binary without `--detach` as a session leader and return
/// once the child run has written its pid file.
fn run_detached(args: &RunArgs) -> Result<ExitCode> {
    let exe = std::env::current_exe().context("resolve current executable")?;
    std::fs::create_dir_all(&args.logs_root)
        .with_context(|| format!("create logs root {}", args.logs_root.display()))?;
    let log_file = std::fs::File::create(args.logs_root.join("detach.log"))
        .context("create detach.log")?;

    let mut forwarded: Vec<String> = std::env::args().skip(1).collect();
    forwarded.retain(|arg| arg != "--detach");

    let mut cmd = std::process::Command::new(exe);
    cmd.args(&forwarded)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(
            log_file.try_clone().context("clone detach.log handle")?,
        ))
        .stderr(std::process::Stdio::from(log_file));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn().context("spawn detached run")?;

    let pid_path = args.logs_root.join("run.pid");
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !pid_path.exists() {
        if std::time::Instant::now() > deadline {
            bail!("detached run did not write run.pid within 10s");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    println!("detached pid={}", child.id());
    Ok(ExitCode::SUCCESS)
}

fn stop_command(args: StopArgs) -> Result<ExitCode> {
    let snapshot = load_snapshot(&args.logs_root).map_err(|error| anyhow!("{error}"))?;
    let Some(pid) = snapshot.pid else {
        bail!("no run.pid under {}", args.logs_root.display());
    };
    if !snapshot.pid_alive {
        println!("stopped={pid} (already exited)");
        return Ok(ExitCode::SUCCESS);
    }

    let run_id = snapshot.run_id.clone().unwrap_or_default();
    let logs_root = args
        .logs_root
        .canonicalize()
        .unwrap_or_else(|_| args.logs_root.clone());
    if !attractor_engine::procutil::verify_run_identity(pid, &logs_root, &run_id)
        && !attractor_engine::procutil::verify_run_identity(pid, &args.logs_root, &run_id)
    {
        bail!("pid {pid} does not look like an attractor run for {}", logs_root.display());
    }

    info!(pid, "stopping run");
    #[cfg(unix)]
    {
        attractor_engine::procutil::signal_pid_group(pid, false);
        let deadline = std::time::Instant::now() + Duration::from_millis(args.grace_ms);
        while attractor_engine::procutil::pid_alive(pid) {
            if std::time::Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        if attractor_engine::procutil::pid_alive(pid) {
            if !args.force {
                bail!("pid {pid} still alive after {}ms grace (use --force)", args.grace_ms);
            }
            attractor_engine::procutil::signal_pid_group(pid, true);
        }
    }
    println!("stopped={pid}");
    Ok(ExitCode::SUCCESS)
}

fn status_command(args: LogsRootArgs) -> Result<ExitCode> {
    let snapshot = load_snapshot(&args.logs_root).map_err(|error| anyhow!("{error}"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("serialize snapshot")?
    );
    match snapshot.state {
        RunState::Fail => Ok(ExitCode::from(2)),
        _ => Ok(ExitCode::SUCCESS),
    }
}

fn validate_command(args: ValidateArgs) -> Result<ExitCode> {
    let dot = std::fs::read_to_string(&args.graph)
        .with_context(|| format!("read graph {}", args.graph.display()))?;
    let graph = match parse_dot(&dot) {
        Ok(graph) => graph,
        Err(error) => {
            eprintln!("parse error: {error}");
            return Ok(ExitCode::from(1));
        }
    };

    let diagnostics = validate_graph(&graph);
    for diagnostic in &diagnostics {
        println!(
            "{:?}: {} ({})",
            diagnostic.severity, diagnostic.message, diagnostic.rule
        );
    }
    if diagnostics.iter().any(|d| d.is_error()) {
        return Ok(ExitCode::from(1));
    }
    println!(
        "ok: {} nodes, {} edges",
        graph.nodes.len(),
        graph.edges.len()
    );
    Ok(ExitCode::SUCCESS)
}
