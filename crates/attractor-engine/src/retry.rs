use crate::graph::{Graph, Node};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryBackoffConfig {
    /// Graph-level `retry.backoff.*` attributes override the configured
    /// defaults.
    pub fn resolve(&self, graph: &Graph) -> Self {
        Self {
            initial_delay_ms: graph
                .attrs
                .get_u64("retry.backoff.initial_delay_ms")
                .unwrap_or(self.initial_delay_ms),
            backoff_factor: graph
                .attrs
                .get("retry.backoff.backoff_factor")
                .and_then(crate::graph::AttrValue::as_f64)
                .unwrap_or(self.backoff_factor),
            max_delay_ms: graph
                .attrs
                .get_u64("retry.backoff.max_delay_ms")
                .unwrap_or(self.max_delay_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoffConfig,
}

/// Attempt budget for a node: its `max_retries` attribute, else the graph's
/// `default_max_retry`, else zero retries.
pub fn build_retry_policy(node: &Node, graph: &Graph, backoff: RetryBackoffConfig) -> RetryPolicy {
    let max_retries = node
        .attrs
        .get_i64("max_retries")
        .or_else(|| graph.attrs.get_i64("default_max_retry"))
        .unwrap_or(0)
        .max(0) as u32;

    RetryPolicy {
        max_attempts: max_retries + 1,
        backoff,
    }
}

/// Exponential backoff delay before the given attempt (1-based: the delay
/// slept before attempt N+1 uses `attempt = N`).
pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig) -> u64 {
    let exp = attempt.saturating_sub(1) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    base.min(config.max_delay_ms as f64).round().max(0.0) as u64
}
