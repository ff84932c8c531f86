mod support;

use attractor_engine::{
    CliCodergenBackend, Engine, EngineConfig, FailureClass, Outcome,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use support::*;
use tempfile::TempDir;

#[cfg(unix)]
fn write_fake_provider(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/bash\n{body}\n")).expect("write fake provider");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn backend_with_override(executable: &Path) -> Arc<CliCodergenBackend> {
    Arc::new(CliCodergenBackend::new(
        BTreeMap::from([("anthropic".to_string(), executable.display().to_string())]),
        Vec::new(),
    ))
}

const GRAPH: &str = r#"
digraph G {
    start [shape=Mdiamond]
    build [shape=box, prompt="implement $goal", llm_provider="anthropic", llm_model="claude-sonnet-4-5"]
    exit [shape=Msquare]
    start -> build -> exit
}
"#;

async fn run_cli_graph(
    logs_root: std::path::PathBuf,
    backend: Arc<CliCodergenBackend>,
) -> attractor_engine::RunResult {
    Engine::run(
        attractor_engine::parse_dot(GRAPH).expect("graph should parse"),
        test_options(logs_root),
        EngineConfig {
            backend: Some(backend),
            ..EngineConfig::default()
        },
    )
    .await
    .expect("run should conclude")
}

#[tokio::test(flavor = "current_thread")]
async fn provider_writes_canonical_status_expected_success() {
    if !cfg!(unix) || !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    #[cfg(unix)]
    {
        let fake = write_fake_provider(
            temp.path(),
            "fake_claude.sh",
            r#"echo "working..."
printf '{"status":"success","context_updates":{"built":true}}' > "$STAGE_STATUS_PATH""#,
        );
        let result = run_cli_graph(logs_root.clone(), backend_with_override(&fake)).await;

        assert_eq!(result.final_outcome.status, "success");
        assert!(logs_root.join("build/cli_invocation.json").exists());
        assert!(logs_root.join("build/prompt.md").exists());
        assert!(logs_root.join("build/stdout.log").exists());

        let status: Outcome =
            attractor_engine::fsutil::read_json(&logs_root.join("build/status.json"))
                .expect("status should load");
        assert_eq!(status.context_updates.get("built"), Some(&serde_json::json!(true)));

        let invocation: serde_json::Value =
            attractor_engine::fsutil::read_json(&logs_root.join("build/cli_invocation.json"))
                .expect("invocation record should load");
        assert_eq!(invocation["env_mode"], "base");
        assert!(invocation["status_path"]
            .as_str()
            .expect("status_path")
            .ends_with("build/status.json"));
    }
}

#[tokio::test(flavor = "current_thread")]
async fn provider_writes_fallback_expected_imported_with_provenance() {
    if !cfg!(unix) || !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    #[cfg(unix)]
    {
        let fake = write_fake_provider(
            temp.path(),
            "fake_claude.sh",
            r#"mkdir -p "$(dirname "$STAGE_STATUS_FALLBACK_PATH")"
printf '{"status":"success","node_id":"build"}' > "$STAGE_STATUS_FALLBACK_PATH""#,
        );
        let result = run_cli_graph(logs_root.clone(), backend_with_override(&fake)).await;

        assert_eq!(result.final_outcome.status, "success");
        let status: Outcome =
            attractor_engine::fsutil::read_json(&logs_root.join("build/status.json"))
                .expect("canonical status should exist after import");
        assert!(status
            .meta_str("ingested_from")
            .expect("provenance marker")
            .ends_with(".attractor/status.json"));

        let all = events(&logs_root);
        assert!(all.iter().any(|e| {
            e.event == "status_ingestion_decision"
                && e.fields.get("decision") == Some(&serde_json::json!("fallback_imported"))
        }));
    }
}

#[tokio::test(flavor = "current_thread")]
async fn configured_fallback_expected_preamble_env_and_ingestion_agree() {
    if !cfg!(unix) || !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    #[cfg(unix)]
    {
        let fake = write_fake_provider(
            temp.path(),
            "fake_claude.sh",
            r#"mkdir -p "$(dirname "$STAGE_STATUS_FALLBACK_PATH")"
printf '{"status":"success"}' > "$STAGE_STATUS_FALLBACK_PATH""#,
        );
        let mut options = test_options(logs_root.clone());
        options.status_fallback_relpaths = vec!["out/stage_status.json".to_string()];

        let result = Engine::run(
            attractor_engine::parse_dot(GRAPH).expect("graph should parse"),
            options,
            EngineConfig {
                backend: Some(backend_with_override(&fake)),
                ..EngineConfig::default()
            },
        )
        .await
        .expect("run should conclude");

        assert_eq!(result.final_outcome.status, "success");

        // The provider wrote to the configured path, and ingestion found it
        // there.
        let status: Outcome =
            attractor_engine::fsutil::read_json(&logs_root.join("build/status.json"))
                .expect("canonical status should exist after import");
        assert!(status
            .meta_str("ingested_from")
            .expect("provenance marker")
            .ends_with("out/stage_status.json"));

        // The prompt preamble and the exported env var named the same path.
        let prompt = std::fs::read_to_string(logs_root.join("build/prompt.md"))
            .expect("prompt.md should exist");
        let invocation: serde_json::Value =
            attractor_engine::fsutil::read_json(&logs_root.join("build/cli_invocation.json"))
                .expect("invocation record should load");
        let exported = invocation["status_fallback_path"]
            .as_str()
            .expect("status_fallback_path");
        assert!(exported.ends_with("out/stage_status.json"));
        assert!(prompt.contains(&format!("$STAGE_STATUS_FALLBACK_PATH = {exported}")));
    }
}

#[tokio::test(flavor = "current_thread")]
async fn provider_silent_failure_expected_classified_from_stderr() {
    if !cfg!(unix) || !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    #[cfg(unix)]
    {
        let fake = write_fake_provider(
            temp.path(),
            "fake_claude.sh",
            r#"echo "connection reset by peer" >&2
exit 1"#,
        );
        let result = run_cli_graph(logs_root.clone(), backend_with_override(&fake)).await;

        assert!(result.final_outcome.is_fail());
        let status: Outcome =
            attractor_engine::fsutil::read_json(&logs_root.join("build/status.json"))
                .expect("status should load");
        assert_eq!(status.failure_class(), FailureClass::TransientInfra);
        assert_eq!(
            status.meta_str("failure_signature"),
            Some("provider_transient|anthropic")
        );
    }
}

#[tokio::test(flavor = "current_thread")]
async fn provider_clean_exit_without_status_expected_contract_failure() {
    if !cfg!(unix) || !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    #[cfg(unix)]
    {
        let fake = write_fake_provider(temp.path(), "fake_claude.sh", r#"echo "done, honest""#);
        let result = run_cli_graph(logs_root.clone(), backend_with_override(&fake)).await;

        assert!(result.final_outcome.is_fail());
        assert!(result
            .final_outcome
            .failure_reason
            .as_deref()
            .expect("failure reason")
            .contains("wrote no status.json"));
    }
}
