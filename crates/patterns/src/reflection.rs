//! Reflection pattern: iterative generate/critique refinement.
//!
//! A generator drafts, a critic scores the draft in [0, 1], and the generator
//! revises using the critique. The loop ends on the first of:
//!
//! - the score reaching `quality_threshold`
//! - the critic signalling that no further improvement is warranted
//! - the last `convergence_window` scores spreading less than
//!   `convergence_epsilon`
//! - `max_iterations`
//!
//! The latest draft is always the output, even when an earlier one scored
//! higher. [`ReflectionRun::best`] selects the highest-scoring iteration.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use troupe_config::ReflectionConfig;
use troupe_core::{CallContext, Message, PatternError, Result, Value};
use troupe_runtime::Runtime;

use crate::{PATTERN_KEY, Pattern};

/// A critic's verdict on one draft.
#[derive(Debug, Clone, PartialEq)]
pub struct Critique {
    pub score: f64,
    pub feedback: String,
    pub done: bool,
}

impl Critique {
    /// Read a verdict from the critic's reply.
    ///
    /// Metadata keys `score`, `feedback` and `done` take precedence. Otherwise
    /// the payload may be a JSON object with the same keys, or a bare number.
    /// Anything else scores zero, with the payload as feedback.
    pub fn from_message(msg: &Message) -> Self {
        let parsed: Option<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(msg.payload.trim()).ok();
        let from_json = |key: &str| {
            parsed
                .as_ref()
                .and_then(|map| map.get(key))
                .map(|v| Value::from(v.clone()))
        };

        let score = msg
            .metadata
            .get_f64("score")
            .or_else(|| from_json("score").and_then(|v| v.as_f64()))
            .or_else(|| msg.payload.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };

        let feedback = msg
            .metadata
            .get_str("feedback")
            .map(str::to_string)
            .or_else(|| from_json("feedback").and_then(|v| v.as_str().map(str::to_string)))
            .unwrap_or_else(|| {
                if parsed.is_some() {
                    String::new()
                } else {
                    msg.payload.clone()
                }
            });

        let done = msg
            .metadata
            .get_bool("done")
            .or_else(|| from_json("done").and_then(|v| v.as_bool()))
            .unwrap_or(false);

        Self {
            score,
            feedback,
            done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QualityThreshold,
    CriticDone,
    Converged,
    MaxIterations,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::QualityThreshold => "quality_threshold",
            StopReason::CriticDone => "critic_done",
            StopReason::Converged => "converged",
            StopReason::MaxIterations => "max_iterations",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Iteration {
    /// 1-based.
    pub number: usize,
    pub output: Message,
    pub critique: Critique,
}

#[derive(Debug, Clone)]
pub struct ReflectionRun {
    pub iterations: Vec<Iteration>,
    pub stop_reason: StopReason,
}

impl ReflectionRun {
    pub fn latest(&self) -> Option<&Iteration> {
        self.iterations.last()
    }

    /// Highest-scoring iteration; the earliest wins ties.
    pub fn best(&self) -> Option<&Iteration> {
        let mut best: Option<&Iteration> = None;
        for iteration in &self.iterations {
            if best.is_none_or(|b| iteration.critique.score > b.critique.score) {
                best = Some(iteration);
            }
        }
        best
    }

    pub fn scores(&self) -> Vec<f64> {
        self.iterations.iter().map(|i| i.critique.score).collect()
    }
}

/// True when the last `window` scores spread less than `epsilon`.
pub fn has_converged(scores: &[f64], window: usize, epsilon: f64) -> bool {
    let window = window.max(2);
    if scores.len() < window {
        return false;
    }
    let recent = &scores[scores.len() - window..];
    let max = recent.iter().copied().fold(f64::MIN, f64::max);
    let min = recent.iter().copied().fold(f64::MAX, f64::min);
    max - min < epsilon
}

pub struct ReflectionPattern {
    runtime: Arc<dyn Runtime>,
    generator: String,
    critic: String,
    max_iterations: usize,
    quality_threshold: f64,
    convergence_window: usize,
    convergence_epsilon: f64,
}

impl ReflectionPattern {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        generator: impl Into<String>,
        critic: impl Into<String>,
    ) -> Self {
        Self::from_config(runtime, generator, critic, &ReflectionConfig::default())
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        generator: impl Into<String>,
        critic: impl Into<String>,
        config: &ReflectionConfig,
    ) -> Self {
        Self {
            runtime,
            generator: generator.into(),
            critic: critic.into(),
            max_iterations: config.max_iterations,
            quality_threshold: config.quality_threshold,
            convergence_window: config.convergence_window,
            convergence_epsilon: config.convergence_epsilon,
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_convergence(mut self, window: usize, epsilon: f64) -> Self {
        self.convergence_window = window;
        self.convergence_epsilon = epsilon;
        self
    }

    fn revision_input(original: &Message, previous: &Iteration) -> Message {
        let payload = format!(
            "{}\n\nPrevious attempt:\n{}\n\nCritique (score {:.2}):\n{}",
            original.payload,
            previous.output.payload,
            previous.critique.score,
            previous.critique.feedback
        );
        original
            .derive(payload)
            .with_metadata("iteration", previous.number + 1)
            .with_metadata("previous_score", previous.critique.score)
            .with_metadata("feedback", previous.critique.feedback.as_str())
    }

    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<ReflectionRun> {
        if self.max_iterations == 0 {
            return Err(PatternError::InvalidConfiguration(
                "reflection needs at least one iteration".into(),
            )
            .into());
        }

        let mut iterations: Vec<Iteration> = Vec::new();
        let mut scores = Vec::new();

        for number in 1..=self.max_iterations {
            let generator_input = match iterations.last() {
                None => input.clone(),
                Some(previous) => Self::revision_input(&input, previous),
            };
            let output = self
                .runtime
                .call(ctx, &self.generator, generator_input)
                .await?;

            let critic_input = input
                .derive(output.payload.clone())
                .with_metadata("iteration", number)
                .with_metadata("original_input", input.payload.as_str());
            let reply = self.runtime.call(ctx, &self.critic, critic_input).await?;
            let critique = Critique::from_message(&reply);
            debug!(
                iteration = number,
                score = critique.score,
                done = critique.done,
                "Reflection: critiqued"
            );

            scores.push(critique.score);
            let stop = if critique.score >= self.quality_threshold {
                Some(StopReason::QualityThreshold)
            } else if critique.done {
                Some(StopReason::CriticDone)
            } else if has_converged(&scores, self.convergence_window, self.convergence_epsilon) {
                Some(StopReason::Converged)
            } else {
                None
            };

            iterations.push(Iteration {
                number,
                output,
                critique,
            });

            if let Some(stop_reason) = stop {
                return Ok(ReflectionRun {
                    iterations,
                    stop_reason,
                });
            }
        }

        Ok(ReflectionRun {
            iterations,
            stop_reason: StopReason::MaxIterations,
        })
    }
}

#[async_trait]
impl Pattern for ReflectionPattern {
    fn name(&self) -> &str {
        "reflection"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(
            generator = %self.generator,
            critic = %self.critic,
            max_iterations = self.max_iterations,
            "Reflection: starting"
        );
        let run = self.run(ctx, input).await?;
        let count = run.iterations.len();
        let stop_reason = run.stop_reason;
        let latest = run
            .iterations
            .into_iter()
            .next_back()
            .ok_or_else(|| PatternError::InvalidConfiguration("no iterations ran".into()))?;

        info!(
            iterations = count,
            score = latest.critique.score,
            stop_reason = %stop_reason,
            "Reflection: complete"
        );
        Ok(latest
            .output
            .with_metadata(PATTERN_KEY, "reflection")
            .with_metadata("iterations", count)
            .with_metadata("final_score", latest.critique.score)
            .with_metadata("stop_reason", stop_reason.as_str()))
    }
}
