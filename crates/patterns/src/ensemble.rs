//! Ensemble pattern: fan out to several models and vote.
//!
//! Unlike [`ParallelPattern`](crate::ParallelPattern), a successful fan-out is
//! not enough. The vote's agreement must reach `min_agreement`, otherwise the
//! ensemble fails even though every model answered.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use troupe_config::EnsembleConfig;
use troupe_core::{CallContext, Message, PatternError, Result};
use troupe_runtime::{ParallelResults, Runtime};

use crate::vote::{self, VotingInput, VotingResult, VotingStrategy};
use crate::{PATTERN_KEY, Pattern};

#[derive(Debug)]
pub struct EnsembleRun {
    pub results: ParallelResults,
    /// The votes cast, sorted by source.
    pub inputs: Vec<VotingInput>,
    pub vote: VotingResult,
}

pub struct EnsemblePattern {
    runtime: Arc<dyn Runtime>,
    models: Vec<String>,
    strategy: VotingStrategy,
    min_agreement: f64,
}

impl EnsemblePattern {
    pub fn new(runtime: Arc<dyn Runtime>, models: Vec<String>) -> Self {
        let defaults = EnsembleConfig::default();
        Self {
            runtime,
            models,
            strategy: VotingStrategy::default(),
            min_agreement: defaults.min_agreement,
        }
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        models: Vec<String>,
        config: &EnsembleConfig,
    ) -> Result<Self> {
        let strategy = config.strategy.parse()?;
        Ok(Self::new(runtime, models)
            .with_strategy(strategy)
            .with_min_agreement(config.min_agreement))
    }

    pub fn with_strategy(mut self, strategy: VotingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_min_agreement(mut self, min_agreement: f64) -> Self {
        self.min_agreement = min_agreement;
        self
    }

    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<EnsembleRun> {
        if self.models.is_empty() {
            return Err(PatternError::InvalidConfiguration(
                "ensemble needs at least one model".into(),
            )
            .into());
        }

        let results = self.runtime.call_parallel(ctx, &self.models, input).await;
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
                "Ensemble: voting without failed models"
            );
        }

        let inputs: Vec<VotingInput> = results
            .successes
            .values()
            .map(VotingInput::from_result)
            .collect();
        let vote = vote::vote(self.strategy, &inputs)?;

        if vote.agreement < self.min_agreement {
            warn!(
                observed = vote.agreement,
                required = self.min_agreement,
                "Ensemble: agreement below threshold"
            );
            return Err(PatternError::InsufficientAgreement {
                observed: vote.agreement,
                required: self.min_agreement,
            }
            .into());
        }

        Ok(EnsembleRun {
            results,
            inputs,
            vote,
        })
    }
}

#[async_trait]
impl Pattern for EnsemblePattern {
    fn name(&self) -> &str {
        "ensemble"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(
            models = self.models.len(),
            strategy = %self.strategy,
            "Ensemble: starting"
        );
        let run = self.run(ctx, input).await?;
        info!(agreement = run.vote.agreement, "Ensemble: complete");

        Ok(Message::response(run.vote.content)
            .with_metadata(PATTERN_KEY, "ensemble")
            .with_metadata("strategy", self.strategy.as_str())
            .with_metadata("agreement", run.vote.agreement)
            .with_metadata("explanation", run.vote.explanation)
            .with_metadata("voters", run.inputs.len()))
    }
}
