mod support;

use async_trait::async_trait;
use attractor_engine::{
    AttractorError, Execution, FailureClass, Node, NodeHandler, Outcome, ProgressEvent,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::*;
use tempfile::TempDir;

/// Handler that sits silent long enough to trip the watchdog, while still
/// honoring cancellation.
struct SilentHandler {
    duration: Duration,
}

#[async_trait]
impl NodeHandler for SilentHandler {
    async fn execute(&self, exec: &Execution, _node: &Node) -> Result<Outcome, AttractorError> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(Outcome::success()),
            _ = exec.cancel.cancelled() => {
                Err(AttractorError::Canceled("stage canceled".to_string()))
            }
        }
    }
}

/// Handler that emits a progress event at a fixed cadence for its whole
/// duration.
struct ChattyHandler {
    duration: Duration,
    cadence: Duration,
}

#[async_trait]
impl NodeHandler for ChattyHandler {
    async fn execute(&self, exec: &Execution, node: &Node) -> Result<Outcome, AttractorError> {
        let deadline = Instant::now() + self.duration;
        while Instant::now() < deadline {
            if exec.cancel.is_cancelled() {
                return Err(AttractorError::Canceled("stage canceled".to_string()));
            }
            tokio::time::sleep(self.cadence).await;
            exec.engine
                .sink()
                .emit(ProgressEvent::new("stage_progress").node(&node.id));
        }
        Ok(Outcome::success())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn silent_stage_expected_stall_timeout() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let mut options = test_options(logs_root.clone());
    options.stall_timeout = Duration::from_millis(150);
    options.stall_check_interval = Duration::from_millis(25);
    options.heartbeat_interval = Duration::from_secs(3600);

    let result = run_graph(
        r#"
        digraph G {
            start [shape=Mdiamond]
            wait [type="silent"]
            exit [shape=Msquare]
            start -> wait
            wait -> exit [condition="outcome=success"]
        }
        "#,
        options,
        registry_with(vec![(
            "silent",
            Arc::new(SilentHandler {
                duration: Duration::from_secs(30),
            }),
        )]),
    )
    .await
    .expect("run should conclude");

    assert!(result.final_outcome.is_fail());
    assert!(result
        .final_outcome
        .failure_reason
        .as_deref()
        .expect("failure reason")
        .contains("stall watchdog"));
}

#[tokio::test(flavor = "current_thread")]
async fn stall_timeout_interrupts_retry_sleep() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let mut options = test_options(logs_root.clone());
    options.stall_timeout = Duration::from_millis(150);
    options.stall_check_interval = Duration::from_millis(25);
    options.heartbeat_interval = Duration::from_secs(3600);

    let started = Instant::now();
    let result = run_graph(
        r#"
        digraph G {
            graph [default_max_retry=5, retry.backoff.initial_delay_ms=30000, retry.backoff.backoff_factor=1, retry.backoff.max_delay_ms=30000]
            start [shape=Mdiamond]
            flaky [type="scripted"]
            exit [shape=Msquare]
            start -> flaky
            flaky -> exit [condition="outcome=success"]
        }
        "#,
        options,
        registry_with(vec![(
            "scripted",
            ScriptedHandler::new(vec![
                Outcome::fail("transient wobble").with_class(FailureClass::TransientInfra)
            ]),
        )]),
    )
    .await
    .expect("run should conclude");

    assert!(result.final_outcome.is_fail());
    assert!(result
        .final_outcome
        .failure_reason
        .as_deref()
        .expect("failure reason")
        .contains("stall watchdog"));
    // The 30s retry sleep was interrupted, not waited out.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "current_thread")]
async fn stall_watchdog_stops_loop_before_fail_edge_traversal() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let mut options = test_options(logs_root.clone());
    options.stall_timeout = Duration::from_millis(150);
    options.stall_check_interval = Duration::from_millis(25);
    options.heartbeat_interval = Duration::from_secs(3600);

    run_graph(
        r#"
        digraph G {
            graph [default_max_retry=5, retry.backoff.initial_delay_ms=30000, retry.backoff.backoff_factor=1, retry.backoff.max_delay_ms=30000]
            start [shape=Mdiamond]
            flaky [type="scripted"]
            after_fail [type="recorder"]
            exit [shape=Msquare]
            start -> flaky
            flaky -> after_fail [condition="outcome=fail"]
            after_fail -> exit [condition="outcome=success"]
        }
        "#,
        options,
        registry_with(vec![
            (
                "scripted",
                ScriptedHandler::new(vec![
                    Outcome::fail("transient wobble").with_class(FailureClass::TransientInfra)
                ]),
            ),
            ("recorder", ScriptedHandler::new(vec![Outcome::success()])),
        ]),
    )
    .await
    .expect("run should conclude");

    let all = events(&logs_root);
    assert!(events_for_node(&all, "stage_attempt_start", "after_fail").is_empty());
    assert_eq!(event_count(&all, "traversal_canceled"), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn active_branch_progress_keeps_parent_alive() {
    if !git_available() {
        return;
    }
    let temp = TempDir::new().expect("temp dir should create");
    let logs_root = temp.path().join("logs");
    let mut options = test_options(logs_root.clone());
    options.stall_timeout = Duration::from_millis(400);
    options.stall_check_interval = Duration::from_millis(50);
    options.heartbeat_interval = Duration::from_secs(3600);

    let result = run_graph(
        r#"
        digraph G {
            start [shape=Mdiamond]
            fan [shape=component]
            busy [type="chatty"]
            quick [type="ok"]
            join [shape=tripleoctagon]
            exit [shape=Msquare]
            start -> fan
            fan -> busy
            fan -> quick
            busy -> join
            quick -> join
            join -> exit
        }
        "#,
        options,
        registry_with(vec![
            (
                "chatty",
                Arc::new(ChattyHandler {
                    duration: Duration::from_millis(1_500),
                    cadence: Duration::from_millis(100),
                }),
            ),
            ("ok", ScriptedHandler::new(vec![Outcome::success()])),
        ]),
    )
    .await
    .expect("run should conclude");

    // Branch events reset parent liveness, so the watchdog never fires even
    // though the branch outlives the stall timeout several times over.
    assert_eq!(result.final_outcome.status, "success");
}
