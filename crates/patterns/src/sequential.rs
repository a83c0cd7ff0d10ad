//! Sequential pipeline pattern.
//!
//! Each agent receives the previous agent's output. The error strategy decides
//! whether a failure ends the pipeline or is stepped over.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use troupe_config::SequentialConfig;
use troupe_core::{CallContext, Error, Message, PatternError, Result};
use troupe_runtime::{ExecutionResult, Runtime};

use crate::{PATTERN_KEY, Pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorStrategy {
    /// End the pipeline at the first failure.
    #[default]
    StopOnError,
    /// Skip the failed step, feeding the last good output onward.
    ContinueOnError,
}

impl ErrorStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStrategy::StopOnError => "stop",
            ErrorStrategy::ContinueOnError => "continue",
        }
    }
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stop" | "stop_on_error" => Ok(ErrorStrategy::StopOnError),
            "continue" | "continue_on_error" => Ok(ErrorStrategy::ContinueOnError),
            other => Err(Error::config(format!("unknown error strategy '{other}'"))),
        }
    }
}

/// Record of one pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// One entry per step attempted, in order.
    pub steps: Vec<ExecutionResult>,
    /// Output of the last step that succeeded.
    pub output: Option<Message>,
    /// Index of the step that stopped the pipeline, under `StopOnError`.
    pub stopped_at: Option<usize>,
}

impl PipelineRun {
    pub fn completed(&self) -> usize {
        self.steps.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.steps.len() - self.completed()
    }
}

pub struct SequentialPattern {
    runtime: Arc<dyn Runtime>,
    agents: Vec<String>,
    strategy: ErrorStrategy,
}

impl SequentialPattern {
    pub fn new(runtime: Arc<dyn Runtime>, agents: Vec<String>) -> Self {
        Self {
            runtime,
            agents,
            strategy: ErrorStrategy::default(),
        }
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        agents: Vec<String>,
        config: &SequentialConfig,
    ) -> Result<Self> {
        let strategy = config.error_strategy.parse()?;
        Ok(Self::new(runtime, agents).with_strategy(strategy))
    }

    pub fn with_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run the pipeline. Step failures are recorded in the returned run, never
    /// raised; only an empty pipeline is an error here.
    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<PipelineRun> {
        if self.agents.is_empty() {
            return Err(PatternError::InvalidConfiguration(
                "sequential pattern needs at least one agent".into(),
            )
            .into());
        }

        let mut steps = Vec::with_capacity(self.agents.len());
        let mut current = input;
        let mut output = None;

        for (index, agent) in self.agents.iter().enumerate() {
            let started = Instant::now();
            match self.runtime.call(ctx, agent, current.clone()).await {
                Ok(reply) => {
                    debug!(step = index, agent = %agent, "Sequential: step complete");
                    steps.push(ExecutionResult::success(
                        agent.clone(),
                        reply.clone(),
                        started.elapsed(),
                    ));
                    current = reply.clone();
                    output = Some(reply);
                }
                Err(e) => {
                    steps.push(ExecutionResult::failure(agent.clone(), &e, started.elapsed()));
                    match self.strategy {
                        ErrorStrategy::StopOnError => {
                            warn!(step = index, agent = %agent, error = %e, "Sequential: stopping");
                            return Ok(PipelineRun {
                                steps,
                                output,
                                stopped_at: Some(index),
                            });
                        }
                        ErrorStrategy::ContinueOnError => {
                            warn!(step = index, agent = %agent, error = %e, "Sequential: skipping failed step");
                        }
                    }
                }
            }
        }

        Ok(PipelineRun {
            steps,
            output,
            stopped_at: None,
        })
    }
}

#[async_trait]
impl Pattern for SequentialPattern {
    fn name(&self) -> &str {
        "sequential"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(steps = self.agents.len(), strategy = %self.strategy, "Sequential: starting");
        let run = self.run(ctx, input).await?;

        if let Some(index) = run.stopped_at {
            let step = &run.steps[index];
            return Err(PatternError::StepFailed {
                index,
                agent: step.agent.clone(),
                completed: run.completed(),
                reason: step.error.clone().unwrap_or_default(),
            }
            .into());
        }

        let completed = run.completed();
        let failed = run.failed();
        let Some(output) = run.output else {
            let summary = run
                .steps
                .iter()
                .map(|s| format!("{}: {}", s.agent, s.error.as_deref().unwrap_or("")))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PatternError::AllAgentsFailed {
                count: failed,
                summary,
            }
            .into());
        };

        info!(completed, failed, "Sequential: complete");
        Ok(output
            .with_metadata(PATTERN_KEY, "sequential")
            .with_metadata("steps_completed", completed)
            .with_metadata("steps_failed", failed))
    }
}
