mod support;

use attractor_engine::{FailureClass, Outcome};
use support::*;
use tempfile::TempDir;

const FAN_GRAPH: &str = r#"
digraph G {
    start [shape=Mdiamond]
    fan [shape=component]
    branch_a [type="scripted_a"]
    branch_b [type="scripted_b"]
    branch_c [type="scripted_c"]
    join [shape=tripleoctagon]
    verify [type="scripted_verify"]
    exit [shape=Msquare]
    start -> fan
    fan -> branch_a
    fan -> branch_b
    fan -> branch_c
    branch_a -> join
    branch_b -> join
    branch_c -> join
    join -> verify
    verify -> exit
}
"#;

#[tokio::test(flavor = "current_thread")]
async fn fan_out_success_expected_winner_and_continuation() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let verify = ScriptedHandler::new(vec![Outcome::success()]);

    let result = run_graph(
        FAN_GRAPH,
        test_options(logs_root.clone()),
        registry_with(vec![
            (
                "scripted_a",
                ScriptedHandler::new(vec![Outcome::fail("a broke")]),
            ),
            ("scripted_b", ScriptedHandler::new(vec![Outcome::success()])),
            ("scripted_c", ScriptedHandler::new(vec![Outcome::success()])),
            ("scripted_verify", verify.clone()),
        ]),
    )
    .await
    .expect("run should conclude");

    assert_eq!(result.final_outcome.status, "success");
    assert_eq!(verify.call_count(), 1);

    // Branch logs land under the fan-out node's namespace.
    assert!(logs_root.join("fan/branch_a/progress.ndjson").exists());
    assert!(logs_root.join("fan/branch_b/branch_b/status.json").exists());

    let all = events(&logs_root);
    assert_eq!(event_count(&all, "branch_started"), 3);
    assert_eq!(event_count(&all, "branch_completed"), 3);

    // Edge-order tiebreak among successes: branch_b wins over branch_c.
    let status: Outcome = attractor_engine::fsutil::read_json(&logs_root.join("join/status.json"))
        .expect("join status should load");
    assert_eq!(
        status.context_updates.get("parallel.winner"),
        Some(&serde_json::json!("branch_b"))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn fan_in_all_fail_mixed_classes_expected_deterministic_terminal_fail() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let verify = ScriptedHandler::new(vec![Outcome::success()]);

    let result = run_graph(
        FAN_GRAPH,
        test_options(logs_root.clone()),
        registry_with(vec![
            (
                "scripted_a",
                ScriptedHandler::new(vec![
                    Outcome::fail("conn reset").with_class(FailureClass::TransientInfra)
                ]),
            ),
            (
                "scripted_b",
                ScriptedHandler::new(vec![
                    Outcome::fail("bad auth token").with_class(FailureClass::Deterministic)
                ]),
            ),
            (
                "scripted_c",
                ScriptedHandler::new(vec![
                    Outcome::fail("socket hangup").with_class(FailureClass::TransientInfra)
                ]),
            ),
            ("scripted_verify", verify.clone()),
        ]),
    )
    .await
    .expect("run should conclude");

    // The unconditional join -> verify edge is skipped on fan-in failure.
    assert!(result.final_outcome.is_fail());
    assert_eq!(verify.call_count(), 0);
    assert!(!logs_root.join("verify/status.json").exists());

    let status: Outcome = attractor_engine::fsutil::read_json(&logs_root.join("join/status.json"))
        .expect("join status should load");
    assert_eq!(status.failure_class(), FailureClass::Deterministic);
    assert!(status
        .meta_str("failure_signature")
        .expect("signature should be set")
        .starts_with("parallel_all_failed|"));
    let reason = status.failure_reason.as_deref().expect("failure reason");
    assert!(reason.contains("branch_a"));
    assert!(reason.contains("branch_b"));
    assert!(reason.contains("branch_c"));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_in_all_transient_expected_transient_aggregate() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    run_graph(
        FAN_GRAPH,
        test_options(logs_root.clone()),
        registry_with(vec![
            (
                "scripted_a",
                ScriptedHandler::new(vec![
                    Outcome::fail("timeout a").with_class(FailureClass::TransientInfra)
                ]),
            ),
            (
                "scripted_b",
                ScriptedHandler::new(vec![
                    Outcome::fail("timeout b").with_class(FailureClass::TransientInfra)
                ]),
            ),
            (
                "scripted_c",
                ScriptedHandler::new(vec![
                    Outcome::fail("timeout c").with_class(FailureClass::TransientInfra)
                ]),
            ),
            ("scripted_verify", ScriptedHandler::new(vec![Outcome::success()])),
        ]),
    )
    .await
    .expect("run should conclude");

    let status: Outcome = attractor_engine::fsutil::read_json(&logs_root.join("join/status.json"))
        .expect("join status should load");
    assert_eq!(status.failure_class(), FailureClass::TransientInfra);
}

#[tokio::test(flavor = "current_thread")]
async fn branch_isolation_expected_independent_worktrees() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    let result = run_graph(
        r#"
        digraph G {
            start [shape=Mdiamond]
            fan [shape=component]
            left [shape=parallelogram, tool_command="echo left > marker.txt"]
            right [shape=parallelogram, tool_command="echo right > marker.txt"]
            join [shape=tripleoctagon]
            exit [shape=Msquare]
            start -> fan
            fan -> left
            fan -> right
            left -> join
            right -> join
            join -> exit
        }
        "#,
        test_options(logs_root.clone()),
        registry_with(vec![]),
    )
    .await
    .expect("run should conclude");

    assert_eq!(result.final_outcome.status, "success");
    let left_marker =
        std::fs::read_to_string(logs_root.join("fan/left/worktree/marker.txt"))
            .expect("left marker should exist");
    let right_marker =
        std::fs::read_to_string(logs_root.join("fan/right/worktree/marker.txt"))
            .expect("right marker should exist");
    assert_eq!(left_marker.trim(), "left");
    assert_eq!(right_marker.trim(), "right");
    // The parent worktree saw neither write.
    assert!(!result.worktree_dir.join("marker.txt").exists());
}
