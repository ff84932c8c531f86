mod support;

use attractor_engine::Outcome;
use support::*;
use tempfile::TempDir;

#[tokio::test(flavor = "current_thread")]
async fn condition_match_first_in_declared_order() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let first = ScriptedHandler::new(vec![Outcome::success()]);
    let second = ScriptedHandler::new(vec![Outcome::success()]);

    run_graph(
        r#"
        digraph G {
            start [shape=Mdiamond]
            router [type="ok"]
            first [type="first"]
            second [type="second"]
            exit [shape=Msquare]
            start -> router
            router -> first [condition="outcome=success"]
            router -> second [condition="outcome=success"]
            first -> exit
            second -> exit
        }
        "#,
        test_options(logs_root.clone()),
        registry_with(vec![
            ("ok", ScriptedHandler::new(vec![Outcome::success()])),
            ("first", first.clone()),
            ("second", second.clone()),
        ]),
    )
    .await
    .expect("run should conclude");

    assert_eq!(first.call_count(), 1);
    assert_eq!(second.call_count(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn preferred_label_routes_among_unconditional_edges() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let yes = ScriptedHandler::new(vec![Outcome::success()]);
    let no = ScriptedHandler::new(vec![Outcome::success()]);

    run_graph(
        r#"
        digraph G {
            start [shape=Mdiamond]
            gate [type="labeler"]
            yes_node [type="yes"]
            no_node [type="no"]
            exit [shape=Msquare]
            start -> gate
            gate -> yes_node [label="approve"]
            gate -> no_node [label="reject"]
            yes_node -> exit
            no_node -> exit
        }
        "#,
        test_options(logs_root.clone()),
        registry_with(vec![
            (
                "labeler",
                ScriptedHandler::new(vec![Outcome::success().with_preferred_label("reject")]),
            ),
            ("yes", yes.clone()),
            ("no", no.clone()),
        ]),
    )
    .await
    .expect("run should conclude");

    assert_eq!(no.call_count(), 1);
    assert_eq!(yes.call_count(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn context_condition_routes_on_stage_updates() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let hotfix = ScriptedHandler::new(vec![Outcome::success()]);

    let mut flagged = Outcome::success();
    flagged
        .context_updates
        .insert("needs_hotfix".to_string(), serde_json::json!(true));

    run_graph(
        r#"
        digraph G {
            start [shape=Mdiamond]
            scan [type="flagger"]
            hotfix [type="hotfix"]
            exit [shape=Msquare]
            start -> scan
            scan -> hotfix [condition="context.needs_hotfix=true"]
            scan -> exit
            hotfix -> exit
        }
        "#,
        test_options(logs_root.clone()),
        registry_with(vec![
            ("flagger", ScriptedHandler::new(vec![flagged])),
            ("hotfix", hotfix.clone()),
        ]),
    )
    .await
    .expect("run should conclude");

    assert_eq!(hotfix.call_count(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn node_retry_target_beats_graph_retry_target() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let node_target = ScriptedHandler::new(vec![Outcome::success()]);
    let graph_target = ScriptedHandler::new(vec![Outcome::success()]);

    run_graph(
        r#"
        digraph G {
            graph [retry_target="graph_rescue"]
            start [shape=Mdiamond]
            work [type="failing", retry_target="node_rescue"]
            node_rescue [type="node_rescue"]
            graph_rescue [type="graph_rescue"]
            exit [shape=Msquare]
            start -> work
            work -> exit [condition="outcome=success"]
            node_rescue -> exit
            graph_rescue -> exit
        }
        "#,
        test_options(logs_root.clone()),
        registry_with(vec![
            (
                "failing",
                ScriptedHandler::new(vec![Outcome::fail("needs rescue")]),
            ),
            ("node_rescue", node_target.clone()),
            ("graph_rescue", graph_target.clone()),
        ]),
    )
    .await
    .expect("run should conclude");

    assert_eq!(node_target.call_count(), 1);
    assert_eq!(graph_target.call_count(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn failure_without_route_or_target_expected_terminal_fail() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");

    let result = run_graph(
        r#"
        digraph G {
            start [shape=Mdiamond]
            work [type="failing"]
            exit [shape=Msquare]
            start -> work
            work -> exit [condition="outcome=success"]
        }
        "#,
        test_options(logs_root.clone()),
        registry_with(vec![(
            "failing",
            ScriptedHandler::new(vec![Outcome::fail("dead end")]),
        )]),
    )
    .await
    .expect("run should conclude");

    assert!(result.final_outcome.is_fail());
    assert_eq!(result.final_outcome.failure_reason.as_deref(), Some("dead end"));
}
