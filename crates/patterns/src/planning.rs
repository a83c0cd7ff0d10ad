//! Planning pattern: a planner agent produces a step graph, which is then
//! executed in declared order.
//!
//! Planner replies are JSON, either `{"steps": [...]}` or a bare array:
//!
//! ```json
//! {"steps": [
//!   {"id": "research", "agent": "searcher", "input": "find sources"},
//!   {"id": "write", "agent": "writer", "input": "summarize {research}", "depends_on": ["research"]}
//! ]}
//! ```
//!
//! A step runs only after all its dependencies completed; `{id}` placeholders
//! in its input are replaced by those dependencies' outputs. An empty input
//! means the original request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use troupe_config::PlanningConfig;
use troupe_core::{CallContext, Error, Message, PatternError, Result, Value};
use troupe_runtime::Runtime;

use crate::{PATTERN_KEY, Pattern};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub agent: String,
    /// Input template. Empty means the original request.
    #[serde(default)]
    pub input: String,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanShape {
    Wrapped(Plan),
    Bare(Vec<PlanStep>),
}

impl Plan {
    /// Parse a planner reply. JSON embedded in surrounding prose is accepted.
    pub fn parse(payload: &str) -> Result<Self> {
        let trimmed = payload.trim();
        let shape = serde_json::from_str::<PlanShape>(trimmed).or_else(|first| {
            extract_json(trimmed)
                .and_then(|json| serde_json::from_str::<PlanShape>(json).ok())
                .ok_or_else(|| PatternError::InvalidPlan(format!("unparseable plan: {first}")))
        })?;
        let plan = match shape {
            PlanShape::Wrapped(plan) => plan,
            PlanShape::Bare(steps) => Plan { steps },
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(PatternError::InvalidPlan("plan has no steps".into()).into());
        }
        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() || step.agent.trim().is_empty() {
                return Err(PatternError::InvalidPlan(
                    "every step needs an id and an agent".into(),
                )
                .into());
            }
            if !ids.insert(step.id.as_str()) {
                return Err(
                    PatternError::InvalidPlan(format!("duplicate step id '{}'", step.id)).into(),
                );
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// The outermost `{...}` or `[...]` span in `text`.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    Completed,
    Failed(String),
    /// Not run; lists the unmet dependencies.
    Skipped(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub id: String,
    pub agent: String,
    pub status: StepStatus,
    pub output: Option<Message>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PlanRun {
    /// The plan that was finally executed.
    pub plan: Plan,
    pub outcomes: Vec<StepOutcome>,
    pub replans: usize,
    /// Output of the last completed step.
    pub output: Message,
}

impl PlanRun {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == StepStatus::Completed)
            .count()
    }
}

pub struct PlanningPattern {
    runtime: Arc<dyn Runtime>,
    planner: String,
    validator: Option<String>,
    max_steps: usize,
    continue_on_error: bool,
    replan_on_failure: bool,
    max_replan_attempts: usize,
}

impl PlanningPattern {
    pub fn new(runtime: Arc<dyn Runtime>, planner: impl Into<String>) -> Self {
        Self::from_config(runtime, planner, &PlanningConfig::default())
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        planner: impl Into<String>,
        config: &PlanningConfig,
    ) -> Self {
        Self {
            runtime,
            planner: planner.into(),
            validator: None,
            max_steps: config.max_steps,
            continue_on_error: config.continue_on_error,
            replan_on_failure: config.replan_on_failure,
            max_replan_attempts: config.max_replan_attempts,
        }
    }

    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn with_replanning(mut self, max_attempts: usize) -> Self {
        self.replan_on_failure = max_attempts > 0;
        self.max_replan_attempts = max_attempts;
        self
    }

    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<PlanRun> {
        let mut replans = 0;
        let mut plan = self.make_plan(ctx, input.clone()).await?;

        loop {
            match self.execute_plan(ctx, &input, &plan).await {
                Ok(outcomes) => {
                    let output = outcomes
                        .iter()
                        .rev()
                        .find_map(|o| o.output.clone())
                        .ok_or_else(|| no_output(&outcomes))?;
                    return Ok(PlanRun {
                        plan,
                        outcomes,
                        replans,
                        output,
                    });
                }
                Err(err @ Error::Pattern(PatternError::StepFailed { .. }))
                    if self.replan_on_failure && replans < self.max_replan_attempts =>
                {
                    replans += 1;
                    warn!(attempt = replans, error = %err, "Planning: step failed, replanning");
                    let failure = err.to_string();
                    let annotated = input
                        .derive(format!(
                            "{}\n\nThe previous plan failed: {failure}\nProduce a revised plan.",
                            input.payload
                        ))
                        .with_metadata("replan_attempt", replans)
                        .with_metadata("failure", failure);
                    plan = self.make_plan(ctx, annotated).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Ask the planner for a plan, then bound and validate it.
    async fn make_plan(&self, ctx: &CallContext, request: Message) -> Result<Plan> {
        let reply = self.runtime.call(ctx, &self.planner, request.clone()).await?;
        let plan = Plan::parse(&reply.payload)?;
        debug!(steps = plan.len(), "Planning: plan received");

        if plan.len() > self.max_steps {
            return Err(PatternError::PlanExceedsMaxSteps {
                steps: plan.len(),
                max: self.max_steps,
            }
            .into());
        }

        if let Some(validator) = &self.validator {
            let listing = serde_json::to_string(&plan)?;
            let verdict = self
                .runtime
                .call(
                    ctx,
                    validator,
                    request
                        .derive(listing)
                        .with_metadata("original_input", request.payload.as_str()),
                )
                .await?;
            if let Err(reason) = read_verdict(&verdict) {
                warn!(validator = %validator, reason = %reason, "Planning: plan rejected");
                return Err(PatternError::PlanRejected(reason).into());
            }
        }
        Ok(plan)
    }

    async fn execute_plan(
        &self,
        ctx: &CallContext,
        input: &Message,
        plan: &Plan,
    ) -> Result<Vec<StepOutcome>> {
        let mut outputs: HashMap<&str, String> = HashMap::new();
        let mut outcomes = Vec::with_capacity(plan.len());

        for (index, step) in plan.steps.iter().enumerate() {
            ctx.check()?;

            let missing: Vec<String> = step
                .depends_on
                .iter()
                .filter(|dep| !outputs.contains_key(dep.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                if !self.continue_on_error {
                    return Err(PatternError::DependenciesNotMet {
                        step: step.id.clone(),
                        missing,
                    }
                    .into());
                }
                debug!(step = %step.id, ?missing, "Planning: skipping step");
                outcomes.push(StepOutcome {
                    id: step.id.clone(),
                    agent: step.agent.clone(),
                    status: StepStatus::Skipped(missing),
                    output: None,
                    duration: Duration::ZERO,
                });
                continue;
            }

            let text = if step.input.trim().is_empty() {
                input.payload.clone()
            } else {
                step.depends_on.iter().fold(step.input.clone(), |text, dep| {
                    let value = outputs.get(dep.as_str()).map(String::as_str).unwrap_or_default();
                    text.replace(&format!("{{{dep}}}"), value)
                })
            };
            let msg = input
                .derive(text)
                .with_metadata("step_id", step.id.as_str())
                .with_metadata("step_index", index);

            let started = Instant::now();
            match self.runtime.call(ctx, &step.agent, msg).await {
                Ok(reply) => {
                    debug!(step = %step.id, agent = %step.agent, "Planning: step completed");
                    outputs.insert(step.id.as_str(), reply.payload.clone());
                    outcomes.push(StepOutcome {
                        id: step.id.clone(),
                        agent: step.agent.clone(),
                        status: StepStatus::Completed,
                        output: Some(reply),
                        duration: started.elapsed(),
                    });
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) if self.continue_on_error => {
                    warn!(step = %step.id, error = %e, "Planning: step failed, continuing");
                    outcomes.push(StepOutcome {
                        id: step.id.clone(),
                        agent: step.agent.clone(),
                        status: StepStatus::Failed(e.to_string()),
                        output: None,
                        duration: started.elapsed(),
                    });
                }
                Err(e) => {
                    let completed = outcomes
                        .iter()
                        .filter(|o| o.status == StepStatus::Completed)
                        .count();
                    return Err(PatternError::StepFailed {
                        index,
                        agent: step.agent.clone(),
                        completed,
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(outcomes)
    }
}

/// `Ok` when the validator approved; `Err(reason)` otherwise.
///
/// Accepts a `valid` metadata flag, a `{"valid": bool, "reason": ...}`
/// payload, or a bare boolean payload. Anything else is a rejection.
fn read_verdict(reply: &Message) -> std::result::Result<(), String> {
    let reason_or = |fallback: &str| {
        reply
            .metadata
            .get_str("reason")
            .map(str::to_string)
            .unwrap_or_else(|| fallback.to_string())
    };

    if let Some(valid) = reply.metadata.get_bool("valid") {
        return if valid {
            Ok(())
        } else {
            Err(reason_or(&reply.payload))
        };
    }

    if let Ok(serde_json::Value::Object(obj)) =
        serde_json::from_str::<serde_json::Value>(reply.payload.trim())
        && let Some(valid) = obj.get("valid").and_then(|v| v.as_bool())
    {
        let reason = obj
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("no reason given");
        return if valid { Ok(()) } else { Err(reason.to_string()) };
    }

    match Value::from(reply.payload.as_str()).as_bool() {
        Some(true) => Ok(()),
        Some(false) => Err(reason_or("validator returned false")),
        None => Err(format!("unrecognized verdict: {}", reply.payload.trim())),
    }
}

fn no_output(outcomes: &[StepOutcome]) -> Error {
    let summary = outcomes
        .iter()
        .map(|o| match &o.status {
            StepStatus::Failed(reason) => format!("{}: {reason}", o.id),
            StepStatus::Skipped(missing) => format!("{}: skipped, missing {missing:?}", o.id),
            StepStatus::Completed => format!("{}: completed", o.id),
        })
        .collect::<Vec<_>>()
        .join("; ");
    PatternError::AllAgentsFailed {
        count: outcomes.len(),
        summary,
    }
    .into()
}

#[async_trait]
impl Pattern for PlanningPattern {
    fn name(&self) -> &str {
        "planning"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(planner = %self.planner, "Planning: starting");
        let run = self.run(ctx, input).await?;
        let completed = run.completed();
        info!(
            steps = run.plan.len(),
            completed,
            replans = run.replans,
            "Planning: complete"
        );

        let total = run.plan.len();
        Ok(Message::response(run.output.payload)
            .with_metadata(PATTERN_KEY, "planning")
            .with_metadata("steps_completed", completed)
            .with_metadata("steps_total", total)
            .with_metadata("replans", run.replans))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{EchoAgent, FailingAgent, FnAgent, ScriptedAgent, started_runtime};
    use troupe_core::{Agent, RuntimeError};

    const TWO_STEPS: &str = r#"{"steps": [
        {"id": "research", "agent": "searcher", "input": "find {topic}"},
        {"id": "write", "agent": "writer", "input": "summarize: {research}", "depends_on": ["research"]}
    ]}"#;

    fn planner(plans: &[&str]) -> Arc<ScriptedAgent> {
        ScriptedAgent::texts("planner", plans)
    }

    #[test]
    fn parses_wrapped_bare_and_embedded_plans() {
        let wrapped = Plan::parse(TWO_STEPS).unwrap();
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped.steps[1].depends_on, vec!["research"]);

        let bare = Plan::parse(r#"[{"id": "a", "agent": "x", "dependencies": []}]"#).unwrap();
        assert_eq!(bare.steps[0].input, "");

        let embedded =
            Plan::parse("Here is the plan:\n[{\"id\": \"a\", \"agent\": \"x\"}]\nGood luck.")
                .unwrap();
        assert_eq!(embedded.steps[0].id, "a");
    }

    #[test]
    fn rejects_bad_plans() {
        for bad in [
            "not a plan",
            "[]",
            r#"[{"id": "a", "agent": "x"}, {"id": "a", "agent": "y"}]"#,
        ] {
            let err = Plan::parse(bad).unwrap_err();
            assert!(
                matches!(err, Error::Pattern(PatternError::InvalidPlan(_))),
                "{bad}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn runs_steps_with_substitution() {
        let planner = planner(&[TWO_STEPS]);
        let runtime = started_runtime(vec![
            planner.agent(),
            EchoAgent::shared("searcher"),
            EchoAgent::shared("writer"),
        ])
        .await;
        let pattern = PlanningPattern::new(runtime, "planner");

        let out = pattern
            .execute(&CallContext::new(), Message::request("rust"))
            .await
            .unwrap();
        // `{topic}` is not a dependency, so it is left alone.
        assert_eq!(out.payload, "writer:summarize: searcher:find {topic}");
        assert_eq!(out.metadata.get_f64("steps_completed"), Some(2.0));
        assert_eq!(out.metadata.get_f64("replans"), Some(0.0));
    }

    #[tokio::test]
    async fn empty_step_input_uses_original_request() {
        let planner = planner(&[r#"[{"id": "only", "agent": "worker"}]"#]);
        let runtime = started_runtime(vec![planner.agent(), EchoAgent::shared("worker")]).await;
        let pattern = PlanningPattern::new(runtime, "planner");

        let run = pattern
            .run(&CallContext::new(), Message::request("do the thing"))
            .await
            .unwrap();
        assert_eq!(run.output.payload, "worker:do the thing");
    }

    #[tokio::test]
    async fn oversized_plan_is_refused() {
        let planner = planner(&[TWO_STEPS]);
        let runtime = started_runtime(vec![planner.agent()]).await;
        let pattern = PlanningPattern::new(runtime, "planner").with_max_steps(1);

        let err = pattern
            .run(&CallContext::new(), Message::request("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pattern(PatternError::PlanExceedsMaxSteps { steps: 2, max: 1 })
        ));
    }

    #[tokio::test]
    async fn validator_can_reject() {
        let planner = planner(&[TWO_STEPS]);
        let validator = FnAgent::shared("validator", |_| {
            Ok(Message::response(r#"{"valid": false, "reason": "too vague"}"#))
        });
        let runtime = started_runtime(vec![planner.agent(), validator]).await;
        let pattern = PlanningPattern::new(runtime, "planner").with_validator("validator");

        let err = pattern
            .run(&CallContext::new(), Message::request("x"))
            .await
            .unwrap_err();
        match err {
            Error::Pattern(PatternError::PlanRejected(reason)) => assert_eq!(reason, "too vague"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn validator_approval_via_metadata() {
        let planner = planner(&[r#"[{"id": "a", "agent": "worker"}]"#]);
        let validator = FnAgent::shared("validator", |_| {
            Ok(Message::response("looks fine").with_metadata("valid", true))
        });
        let runtime = started_runtime(vec![
            planner.agent(),
            validator,
            EchoAgent::shared("worker"),
        ])
        .await;
        let pattern = PlanningPattern::new(runtime, "planner").with_validator("validator");

        let run = pattern
            .run(&CallContext::new(), Message::request("go"))
            .await
            .unwrap();
        assert_eq!(run.completed(), 1);
    }

    #[tokio::test]
    async fn dependency_order_is_enforced() {
        let planner = planner(&[r#"[
            {"id": "b", "agent": "worker", "depends_on": ["a"]},
            {"id": "a", "agent": "worker"}
        ]"#]);
        let runtime = started_runtime(vec![planner.agent(), EchoAgent::shared("worker")]).await;
        let pattern = PlanningPattern::new(runtime, "planner");

        let err = pattern
            .run(&CallContext::new(), Message::request("x"))
            .await
            .unwrap_err();
        match err {
            Error::Pattern(PatternError::DependenciesNotMet { step, missing }) => {
                assert_eq!(step, "b");
                assert_eq!(missing, vec!["a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn continue_on_error_records_failures_and_skips() {
        let planner = planner(&[r#"[
            {"id": "a", "agent": "broken"},
            {"id": "b", "agent": "worker", "depends_on": ["a"]},
            {"id": "c", "agent": "worker", "input": "independent"}
        ]"#]);
        let runtime = started_runtime(vec![
            planner.agent(),
            FailingAgent::shared("broken"),
            EchoAgent::shared("worker"),
        ])
        .await;
        let pattern = PlanningPattern::new(runtime, "planner").with_continue_on_error(true);

        let run = pattern
            .run(&CallContext::new(), Message::request("x"))
            .await
            .unwrap();
        assert!(matches!(run.outcomes[0].status, StepStatus::Failed(_)));
        assert_eq!(run.outcomes[1].status, StepStatus::Skipped(vec!["a".into()]));
        assert_eq!(run.outcomes[2].status, StepStatus::Completed);
        assert_eq!(run.output.payload, "worker:independent");
    }

    #[tokio::test]
    async fn step_failure_aborts_without_replanning() {
        let planner = planner(&[r#"[{"id": "w", "agent": "worker"}, {"id": "x", "agent": "broken"}]"#]);
        let runtime = started_runtime(vec![
            planner.agent(),
            EchoAgent::shared("worker"),
            FailingAgent::shared("broken"),
        ])
        .await;
        let pattern = PlanningPattern::new(runtime, "planner");

        let err = pattern
            .run(&CallContext::new(), Message::request("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pattern(PatternError::StepFailed { index: 1, completed: 1, .. })
        ));
        assert_eq!(planner.call_count(), 1);
    }

    #[tokio::test]
    async fn replans_after_failure_with_annotated_input() {
        let planner = planner(&[
            r#"[{"id": "a", "agent": "broken"}]"#,
            r#"[{"id": "a", "agent": "worker"}]"#,
        ]);
        let runtime = started_runtime(vec![
            planner.agent(),
            FailingAgent::shared("broken"),
            EchoAgent::shared("worker"),
        ])
        .await;
        let pattern = PlanningPattern::new(runtime, "planner").with_replanning(2);

        let run = pattern
            .run(&CallContext::new(), Message::request("task"))
            .await
            .unwrap();
        assert_eq!(run.replans, 1);
        assert_eq!(run.output.payload, "worker:task");

        let second = &planner.inputs()[1];
        assert!(second.payload.starts_with("task\n\nThe previous plan failed"));
        assert_eq!(second.metadata.get_f64("replan_attempt"), Some(1.0));
        assert!(second.metadata.get_str("failure").is_some());
    }

    #[tokio::test]
    async fn replanning_is_bounded() {
        let failing_plan = r#"[{"id": "a", "agent": "broken"}]"#;
        let planner = planner(&[failing_plan, failing_plan, failing_plan]);
        let runtime =
            started_runtime(vec![planner.agent(), FailingAgent::shared("broken")]).await;
        let pattern = PlanningPattern::new(runtime, "planner").with_replanning(2);

        let err = pattern
            .run(&CallContext::new(), Message::request("task"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pattern(PatternError::StepFailed { .. })));
        assert_eq!(planner.call_count(), 3);
    }

    #[tokio::test]
    async fn cancellation_is_not_replanned() {
        let planner = planner(&[r#"[{"id": "a", "agent": "worker"}]"#]);
        let worker: Arc<dyn Agent> = EchoAgent::shared("worker");
        let runtime = started_runtime(vec![planner.agent(), worker]).await;
        let pattern = PlanningPattern::new(runtime, "planner").with_replanning(2);

        let ctx = CallContext::new();
        ctx.cancel();
        let err = pattern
            .run(&ctx, Message::request("task"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(RuntimeError::Cancelled)));
    }
}
