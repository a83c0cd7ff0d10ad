//! Hierarchical delegation pattern.
//!
//! # Architecture
//!
//! ```text
//!        input
//!          │
//!          ▼
//!   ┌─────────────┐
//!   │   Manager    │  ← phase 1: decompose into team assignments
//!   └──┬──────┬────┘
//!      │      │
//!      ▼      ▼
//!  ┌──────┐ ┌──────────────┐
//!  │ team │ │ team (n > 1) │  ← phase 2: one worker is called directly,
//!  └──────┘ └──────────────┘    several fan out and vote
//!      │      │
//!      ▼      ▼
//!   ┌─────────────┐
//!   │   Manager    │  ← phase 3: synthesize the team results
//!   └─────────────┘
//! ```
//!
//! A team may itself be a hierarchy ([`Team::Delegate`]); nesting is bounded
//! by `max_depth`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};
use troupe_config::HierarchicalConfig;
use troupe_core::{CallContext, Message, Metadata, PatternError, Result, Value};
use troupe_runtime::Runtime;

use crate::vote::{self, VotingInput};
use crate::{PATTERN_KEY, Pattern};

/// Who carries out a team's assignment.
pub enum Team {
    /// Named agents. One is called directly; several fan out and vote.
    Workers(Vec<String>),
    /// A nested hierarchy.
    Delegate(Box<HierarchicalPattern>),
}

impl Team {
    pub fn worker(name: impl Into<String>) -> Self {
        Team::Workers(vec![name.into()])
    }
}

/// One assignment from the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub team: String,
    pub task: String,
}

#[derive(Debug, Clone)]
pub struct TeamResult {
    pub team: String,
    pub task: String,
    pub output: String,
    /// 1.0 for a single worker or a nested hierarchy.
    pub agreement: f64,
}

#[derive(Debug, Clone)]
pub struct HierarchyRun {
    pub assignments: Vec<Assignment>,
    pub team_results: Vec<TeamResult>,
    /// Teams named by the manager that are not configured.
    pub skipped: Vec<String>,
    pub output: Message,
    pub depth: usize,
}

/// Read team assignments from the manager's reply.
///
/// Accepts, in order: a metadata map under `assignments`, a JSON object in
/// the payload (`{"team": "task"}`), or `team: task` lines. Later assignments
/// to the same team replace earlier ones.
pub fn parse_assignments(reply: &Message) -> Vec<Assignment> {
    let collect = |map: &BTreeMap<String, Value>| -> Vec<Assignment> {
        map.iter()
            .filter_map(|(team, task)| {
                task.as_str().map(|task| Assignment {
                    team: team.clone(),
                    task: task.to_string(),
                })
            })
            .collect()
    };

    if let Some(map) = reply.metadata.get_map("assignments") {
        return collect(map);
    }

    if let Ok(serde_json::Value::Object(object)) =
        serde_json::from_str::<serde_json::Value>(reply.payload.trim())
    {
        let map: BTreeMap<String, Value> = object
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        return collect(&map);
    }

    let mut by_team: BTreeMap<String, String> = BTreeMap::new();
    for line in reply.payload.lines() {
        let line = line.trim().trim_start_matches(['-', '*']).trim();
        if let Some((team, task)) = line.split_once(':') {
            let team = team.trim();
            let task = task.trim();
            if !team.is_empty() && !team.contains(char::is_whitespace) && !task.is_empty() {
                by_team.insert(team.to_string(), task.to_string());
            }
        }
    }
    by_team
        .into_iter()
        .map(|(team, task)| Assignment { team, task })
        .collect()
}

pub struct HierarchicalPattern {
    runtime: Arc<dyn Runtime>,
    manager: String,
    teams: BTreeMap<String, Team>,
    max_depth: usize,
}

impl HierarchicalPattern {
    pub fn new(runtime: Arc<dyn Runtime>, manager: impl Into<String>) -> Self {
        Self {
            runtime,
            manager: manager.into(),
            teams: BTreeMap::new(),
            max_depth: HierarchicalConfig::default().max_depth,
        }
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        manager: impl Into<String>,
        config: &HierarchicalConfig,
    ) -> Self {
        Self::new(runtime, manager).with_max_depth(config.max_depth)
    }

    pub fn with_team(mut self, name: impl Into<String>, team: Team) -> Self {
        self.teams.insert(name.into(), team);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<HierarchyRun> {
        self.run_at_depth(ctx, input, 1).await
    }

    fn run_at_depth<'a>(
        &'a self,
        ctx: &'a CallContext,
        input: Message,
        depth: usize,
    ) -> BoxFuture<'a, Result<HierarchyRun>> {
        Box::pin(async move {
            if depth > self.max_depth {
                return Err(PatternError::MaxDepthExceeded {
                    depth,
                    max: self.max_depth,
                }
                .into());
            }

            // ── Phase 1: delegate ──
            let delegate_input = input
                .derive(input.payload.clone())
                .with_metadata("phase", "delegate")
                .with_metadata("teams", self.team_names())
                .with_metadata("depth", depth);
            let plan = self.runtime.call(ctx, &self.manager, delegate_input).await?;

            let mut assignments = parse_assignments(&plan);
            if assignments.is_empty() {
                debug!(manager = %self.manager, "Hierarchical: no assignments parsed, sending input to every team");
                assignments = self
                    .teams
                    .keys()
                    .map(|team| Assignment {
                        team: team.clone(),
                        task: input.payload.clone(),
                    })
                    .collect();
            }

            // ── Phase 2: execute ──
            let mut team_results = Vec::new();
            let mut skipped = Vec::new();
            for assignment in &assignments {
                let Some(team) = self.teams.get(&assignment.team) else {
                    warn!(team = %assignment.team, "Hierarchical: skipping unconfigured team");
                    skipped.push(assignment.team.clone());
                    continue;
                };
                let task = input
                    .derive(assignment.task.clone())
                    .with_metadata("phase", "execute")
                    .with_metadata("team", assignment.team.as_str());
                let (output, agreement) = self.run_team(ctx, team, task, depth).await?;
                debug!(team = %assignment.team, agreement, "Hierarchical: team finished");
                team_results.push(TeamResult {
                    team: assignment.team.clone(),
                    task: assignment.task.clone(),
                    output,
                    agreement,
                });
            }

            // ── Phase 3: synthesize ──
            let combined = team_results
                .iter()
                .map(|r| format!("[{}]\n{}", r.team, r.output))
                .collect::<Vec<_>>()
                .join("\n\n");
            let results_map: Metadata = team_results
                .iter()
                .map(|r| (r.team.clone(), Value::from(r.output.as_str())))
                .collect();
            let synthesis_input = input
                .derive(format!(
                    "Original task:\n{}\n\nTeam results:\n{}",
                    input.payload, combined
                ))
                .with_metadata("phase", "synthesis")
                .with_metadata("synthesis", true)
                .with_metadata("team_results", results_map);
            let output = self
                .runtime
                .call(ctx, &self.manager, synthesis_input)
                .await?;

            Ok(HierarchyRun {
                assignments,
                team_results,
                skipped,
                output,
                depth,
            })
        })
    }

    async fn run_team(
        &self,
        ctx: &CallContext,
        team: &Team,
        task: Message,
        depth: usize,
    ) -> Result<(String, f64)> {
        match team {
            Team::Workers(workers) => match workers.as_slice() {
                [] => Err(PatternError::InvalidConfiguration("team has no workers".into()).into()),
                [single] => {
                    let reply = self.runtime.call(ctx, single, task).await?;
                    Ok((reply.payload, 1.0))
                }
                several => {
                    let results = self.runtime.call_parallel(ctx, several, task).await;
                    if results.all_failed() {
                        return Err(PatternError::AllAgentsFailed {
                            count: results.errors.len(),
                            summary: results.failure_summary(),
                        }
                        .into());
                    }
                    let inputs: Vec<VotingInput> = results
                        .successes
                        .values()
                        .map(VotingInput::from_result)
                        .collect();
                    let outcome = vote::majority_vote(&inputs)?;
                    Ok((outcome.content, outcome.agreement))
                }
            },
            Team::Delegate(sub) => {
                let run = sub.run_at_depth(ctx, task, depth + 1).await?;
                Ok((run.output.payload, 1.0))
            }
        }
    }

    fn team_names(&self) -> Value {
        Value::List(self.teams.keys().map(|k| Value::from(k.as_str())).collect())
    }
}

#[async_trait]
impl Pattern for HierarchicalPattern {
    fn name(&self) -> &str {
        "hierarchical"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(manager = %self.manager, teams = self.teams.len(), "Hierarchical: starting");
        let run = self.run(ctx, input).await?;
        info!(
            teams = run.team_results.len(),
            skipped = run.skipped.len(),
            "Hierarchical: complete"
        );
        let teams = run.team_results.len();
        let skipped = run.skipped.len();
        Ok(run
            .output
            .with_metadata(PATTERN_KEY, "hierarchical")
            .with_metadata("teams", teams)
            .with_metadata("skipped_teams", skipped))
    }
}
