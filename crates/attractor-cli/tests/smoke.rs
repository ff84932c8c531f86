use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn write_dot_file(path: &Path) {
    let source = r#"
        digraph G {
            start [shape=Mdiamond]
            plan [shape=box, prompt="plan the work"]
            exit [shape=Msquare]
            start -> plan -> exit
        }
    "#;
    std::fs::write(path, source).expect("dot file write should succeed");
}

fn write_config(path: &Path) {
    std::fs::write(
        path,
        r#"{"backend": "simulated", "preflight": "skip"}"#,
    )
    .expect("config write should succeed");
}

fn run_cli(args: &[&str], cwd: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_attractor"))
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("cli process should start")
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[test]
fn validate_command_well_formed_graph_expected_ok() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("pipeline.dot");
    write_dot_file(&dot_file);

    let output = run_cli(
        &["validate", "--graph", dot_file.to_str().expect("utf8 path")],
        temp.path(),
    );

    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("ok: 3 nodes"));
}

#[test]
fn validate_command_missing_start_expected_nonzero_exit() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("pipeline.dot");
    std::fs::write(&dot_file, "digraph G { a -> b }").expect("dot write");

    let output = run_cli(
        &["validate", "--graph", dot_file.to_str().expect("utf8 path")],
        temp.path(),
    );
    assert!(!output.status.success());
}

#[test]
fn run_command_simulated_backend_expected_success_and_artifacts() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("pipeline.dot");
    let config = temp.path().join("config.json");
    let logs_root = temp.path().join("logs");
    write_dot_file(&dot_file);
    write_config(&config);

    let output = run_cli(
        &[
            "run",
            "--graph",
            dot_file.to_str().expect("utf8 path"),
            "--config",
            config.to_str().expect("utf8 path"),
            "--run-id",
            "smoke-run",
            "--logs-root",
            logs_root.to_str().expect("utf8 path"),
            "--allow-test-shim",
        ],
        temp.path(),
    );

    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("run_id=smoke-run"));
    assert!(stdout.contains("status=success"));
    assert!(logs_root.join("final.json").exists());
    assert!(logs_root.join("progress.ndjson").exists());
}

#[test]
fn status_command_after_run_expected_terminal_state() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("pipeline.dot");
    let config = temp.path().join("config.json");
    let logs_root = temp.path().join("logs");
    write_dot_file(&dot_file);
    write_config(&config);

    let run = run_cli(
        &[
            "run",
            "--graph",
            dot_file.to_str().expect("utf8 path"),
            "--config",
            config.to_str().expect("utf8 path"),
            "--run-id",
            "status-run",
            "--logs-root",
            logs_root.to_str().expect("utf8 path"),
            "--allow-test-shim",
        ],
        temp.path(),
    );
    assert!(run.status.success());

    let output = run_cli(
        &["status", "--logs-root", logs_root.to_str().expect("utf8 path")],
        temp.path(),
    );
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("\"state\": \"success\""));
    assert!(stdout.contains("status-run"));
}

#[test]
fn simulated_backend_without_shim_flag_expected_refused() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("pipeline.dot");
    let config = temp.path().join("config.json");
    write_dot_file(&dot_file);
    write_config(&config);

    let output = run_cli(
        &[
            "run",
            "--graph",
            dot_file.to_str().expect("utf8 path"),
            "--config",
            config.to_str().expect("utf8 path"),
            "--logs-root",
            temp.path().join("logs").to_str().expect("utf8 path"),
        ],
        temp.path(),
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("allow-test-shim"));
}
