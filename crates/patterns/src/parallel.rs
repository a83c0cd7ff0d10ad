//! Parallel fan-out pattern.
//!
//! Identical input goes to every agent at once; the successful results are
//! folded into one message by an aggregation function.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use troupe_config::ParallelConfig;
use troupe_core::{CallContext, Message, PatternError, Result};
use troupe_runtime::{ParallelResults, Runtime};

use crate::aggregate::{AggregateFn, Aggregation};
use crate::{PATTERN_KEY, Pattern};

pub struct ParallelPattern {
    runtime: Arc<dyn Runtime>,
    agents: Vec<String>,
    fail_fast: bool,
    aggregator: AggregateFn,
    aggregation_label: String,
}

impl ParallelPattern {
    /// Fan out to `agents`, merging results, tolerating partial failure.
    pub fn new(runtime: Arc<dyn Runtime>, agents: Vec<String>) -> Self {
        Self {
            runtime,
            agents,
            fail_fast: false,
            aggregator: Aggregation::Merge.into_fn(),
            aggregation_label: Aggregation::Merge.to_string(),
        }
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        agents: Vec<String>,
        config: &ParallelConfig,
    ) -> Result<Self> {
        let aggregation: Aggregation = config.aggregation.parse()?;
        Ok(Self::new(runtime, agents)
            .with_fail_fast(config.fail_fast)
            .with_aggregation(aggregation))
    }

    /// Abort with the first error (by agent name) if any agent fails.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregator = aggregation.into_fn();
        self.aggregation_label = aggregation.to_string();
        self
    }

    /// Use a custom aggregation function.
    pub fn with_aggregator(mut self, label: impl Into<String>, aggregator: AggregateFn) -> Self {
        self.aggregator = aggregator;
        self.aggregation_label = label.into();
        self
    }

    /// Fan out and apply the failure policy, returning the raw results.
    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<ParallelResults> {
        if self.agents.is_empty() {
            return Err(PatternError::InvalidConfiguration(
                "parallel pattern needs at least one agent".into(),
            )
            .into());
        }

        let mut results = self.runtime.call_parallel(ctx, &self.agents, input).await;

        if self.fail_fast {
            if let Some((agent, err)) = results.take_first_error() {
                warn!(agent = %agent, error = %err, "Parallel: fail-fast abort");
                return Err(err);
            }
        }

        if results.all_failed() {
            return Err(PatternError::AllAgentsFailed {
                count: results.errors.len(),
                summary: results.failure_summary(),
            }
            .into());
        }

        if !results.errors.is_empty() {
            warn!(
                failed = results.errors.len(),
                succeeded = results.successes.len(),
                "Parallel: continuing with partial results"
            );
        }
        Ok(results)
    }
}

#[async_trait]
impl Pattern for ParallelPattern {
    fn name(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(agents = self.agents.len(), fail_fast = self.fail_fast, "Parallel: starting");
        let results = self.run(ctx, input).await?;
        let output = (self.aggregator)(&results)?;

        info!(
            succeeded = results.successes.len(),
            failed = results.errors.len(),
            aggregation = %self.aggregation_label,
            "Parallel: complete"
        );
        Ok(output
            .with_metadata(PATTERN_KEY, "parallel")
            .with_metadata("aggregation", self.aggregation_label.as_str())
            .with_metadata("succeeded", results.successes.len())
            .with_metadata("failed", results.errors.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{EchoAgent, FailingAgent, names, started_runtime};
    use troupe_core::{Error, RuntimeError};

    #[tokio::test]
    async fn aggregates_successful_subset() {
        let runtime =
            started_runtime(vec![EchoAgent::shared("a"), EchoAgent::shared("b")]).await;
        let pattern = ParallelPattern::new(runtime, names(&["a", "b", "c"]));

        let out = pattern
            .execute(&CallContext::new(), Message::request("x"))
            .await
            .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&out.payload).unwrap();
        assert_eq!(parsed, serde_json::json!({"a": "a:x", "b": "b:x"}));
        assert_eq!(out.metadata.get_f64("failed"), Some(1.0));
        assert_eq!(out.metadata.get_str(PATTERN_KEY), Some("parallel"));
    }

    #[tokio::test]
    async fn fail_fast_surfaces_the_error() {
        let runtime = started_runtime(vec![EchoAgent::shared("a")]).await;
        let pattern = ParallelPattern::new(runtime, names(&["a", "b"])).with_fail_fast(true);

        let err = pattern
            .execute(&CallContext::new(), Message::request("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(RuntimeError::NotFound(ref n)) if n == "b"));
    }

    #[tokio::test]
    async fn all_failures_are_an_error() {
        let runtime =
            started_runtime(vec![FailingAgent::shared("a"), FailingAgent::shared("b")]).await;
        let pattern = ParallelPattern::new(runtime, names(&["a", "b"]));

        let err = pattern
            .execute(&CallContext::new(), Message::request("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pattern(PatternError::AllAgentsFailed { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn config_selects_aggregation() {
        let runtime =
            started_runtime(vec![EchoAgent::shared("a"), EchoAgent::shared("b")]).await;
        let config = ParallelConfig {
            fail_fast: false,
            aggregation: "concat".into(),
        };
        let pattern = ParallelPattern::from_config(runtime, names(&["b", "a"]), &config).unwrap();

        let out = pattern
            .execute(&CallContext::new(), Message::request("x"))
            .await
            .unwrap();
        assert_eq!(out.payload, "a:x\nb:x");
        assert_eq!(out.metadata.get_str("aggregation"), Some("concat"));
    }

    #[tokio::test]
    async fn empty_agent_list_is_rejected() {
        let runtime = started_runtime(vec![]).await;
        let pattern = ParallelPattern::new(runtime, vec![]);
        let err = pattern
            .run(&CallContext::new(), Message::request("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pattern(PatternError::InvalidConfiguration(_))
        ));
    }
}
