use crate::engine::Execution;
use crate::errors::AttractorError;
use crate::fsutil::ensure_dir;
use crate::graph::Node;
use crate::handlers::NodeHandler;
use crate::node_env::{STAGE_STATUS_FALLBACK_PATH_VAR, STAGE_STATUS_PATH_VAR};
use crate::outcome::Outcome;
use async_trait::async_trait;
use tracing::{debug, warn};

/// LLM-driven code generation stage. Builds the prompt (status contract
/// preamble + node prompt), resolves the provider/model pin, invokes the
/// configured backend, and walks the failover chain when the failure class
/// permits it.
#[derive(Debug, Default)]
pub struct CodergenHandler;

#[async_trait]
impl NodeHandler for CodergenHandler {
    async fn execute(&self, exec: &Execution, node: &Node) -> Result<Outcome, AttractorError> {
        let options = exec.engine.options();
        let graph = exec.engine.graph();

        let mut body = node
            .attrs
            .get_str("prompt")
            .unwrap_or_default()
            .trim()
            .to_string();
        if body.is_empty() {
            body = node
                .attrs
                .get_str("label")
                .unwrap_or(node.id.as_str())
                .to_string();
        }
        if let Some(goal) = graph.attrs.get_str("goal") {
            body = body.replace("$goal", goal);
        }

        let status_path = exec.stage_logs_dir.join("status.json");
        // The same configured fallback the backend exports as
        // $STAGE_STATUS_FALLBACK_PATH; the advertised path and the env var
        // must never disagree.
        let fallback_path = options.primary_status_fallback(&exec.worktree_dir);
        let prompt = format!(
            "{}\n\n{}",
            status_contract_preamble(&status_path, &fallback_path),
            body
        );

        ensure_dir(&exec.stage_logs_dir)?;
        std::fs::write(exec.stage_logs_dir.join("prompt.md"), &prompt)
            .map_err(|error| AttractorError::io(exec.stage_logs_dir.join("prompt.md"), error))?;

        let provider = node
            .attrs
            .get_str("llm_provider")
            .unwrap_or(&options.default_provider)
            .trim()
            .to_string();
        let model = node
            .attrs
            .get_str("llm_model")
            .unwrap_or(&options.default_model)
            .trim()
            .to_string();
        if provider.is_empty() || model.is_empty() {
            return Ok(Outcome::fail(format!(
                "codergen node '{}' has no resolvable provider/model pin",
                node.id
            )));
        }

        let backend = exec.engine.backend().clone();
        let mut outcome = backend
            .run(exec, node, &prompt, &provider, &model)
            .await?
            .normalized();

        // An explicit empty failover list means "pin, no fallback".
        let chain: &[String] = options.failover_chain.as_deref().unwrap_or(&[]);
        if outcome.status.is_failure_like() && !chain.is_empty() && failover_permitted(&outcome) {
            for fallback_provider in chain {
                let fallback_provider = fallback_provider.trim();
                if fallback_provider.is_empty() || fallback_provider == provider {
                    continue;
                }
                if exec.cancel.is_cancelled() {
                    return Err(AttractorError::Canceled("failover canceled".to_string()));
                }
                warn!(
                    node = %node.id,
                    from = %provider,
                    to = %fallback_provider,
                    "provider failover"
                );
                outcome = backend
                    .run(exec, node, &prompt, fallback_provider, &model)
                    .await?
                    .normalized();
                if !outcome.status.is_failure_like() || !failover_permitted(&outcome) {
                    break;
                }
            }
        }

        debug!(node = %node.id, status = outcome.status.as_str(), "codergen stage finished");
        Ok(outcome)
    }
}

/// Quota exhaustion consults the failover chain; content-filter and every
/// other deterministic failure stay pinned.
fn failover_permitted(outcome: &Outcome) -> bool {
    outcome.failure_code() == Some(crate::failure::CODE_QUOTA_EXCEEDED)
}

fn status_contract_preamble(status_path: &std::path::Path, fallback_path: &std::path::Path) -> String {
    format!(
        "## Stage status contract\n\
         \n\
         When the stage is complete, write a JSON status object to exactly one\n\
         of these absolute paths (primary first):\n\
         \n\
         - ${STAGE_STATUS_PATH_VAR} = {}\n\
         - ${STAGE_STATUS_FALLBACK_PATH_VAR} = {}\n\
         \n\
         The object must contain `status` (one of success, partial_success,\n\
         retry, fail) and, for retry/fail, a non-empty `failure_reason`.\n\
         Optional keys: `preferred_label`, `context_updates`, `meta`.\n\
         Do not write status.json anywhere else in the repository.",
        status_path.display(),
        fallback_path.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn preamble_names_both_contract_paths() {
        let preamble = status_contract_preamble(
            Path::new("/logs/impl/status.json"),
            Path::new("/wt/.attractor/status.json"),
        );
        assert!(preamble.contains("$STAGE_STATUS_PATH = /logs/impl/status.json"));
        assert!(preamble.contains("$STAGE_STATUS_FALLBACK_PATH = /wt/.attractor/status.json"));
        assert!(preamble.contains("Do not write status.json anywhere else"));
    }

    #[test]
    fn failover_permitted_only_for_quota() {
        let quota = Outcome::fail("quota exceeded").with_code(crate::failure::CODE_QUOTA_EXCEEDED);
        assert!(failover_permitted(&quota));

        let filtered = Outcome::fail("blocked").with_code(crate::failure::CODE_CONTENT_FILTER);
        assert!(!failover_permitted(&filtered));

        let plain = Outcome::fail("boom");
        assert!(!failover_permitted(&plain));
    }
}
