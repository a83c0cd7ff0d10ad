//! Coordination patterns: structured ways of composing agent calls.
//!
//! Every pattern is bound to a [`Runtime`](troupe_runtime::Runtime) and a set
//! of agent names at construction, and drives its algorithm through `call` and
//! `call_parallel`:
//!
//! 1. **Parallel**: fan out, aggregate the successes
//! 2. **Sequential**: linear pipeline
//! 3. **MapReduce**: split, map under bounded concurrency, reduce
//! 4. **Ensemble**: fan out, then vote with an agreement gate
//! 5. **Reflection**: generate/critique loop with convergence detection
//! 6. **Hierarchical**: manager delegates to teams, then synthesizes
//! 7. **Swarm**: decentralized handoff chain
//! 8. **RAG**: retrieval with multi-query and hybrid rank fusion
//! 9. **Planning**: planner-produced step graph with replanning
//!
//! Each pattern offers `run`, returning a detailed record of what happened,
//! and implements [`Pattern`], whose `execute` returns only the final message.

pub mod aggregate;
pub mod ensemble;
pub mod hierarchical;
pub mod map_reduce;
pub mod parallel;
pub mod planning;
pub mod rag;
pub mod reflection;
pub mod sequential;
pub mod swarm;
pub mod vote;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};
use troupe_core::{Agent, CallContext, Error, Message, Result};

pub use aggregate::{AggregateFn, Aggregation};
pub use ensemble::{EnsemblePattern, EnsembleRun};
pub use hierarchical::{HierarchicalPattern, HierarchyRun, Team, TeamResult};
pub use map_reduce::{ChunkOutcome, MapReducePattern, MapReduceRun};
pub use parallel::ParallelPattern;
pub use planning::{Plan, PlanRun, PlanStep, PlanningPattern, StepOutcome, StepStatus};
pub use rag::{ConversationTurn, Document, RagMode, RagPattern, RagRun};
pub use reflection::{Critique, ReflectionPattern, ReflectionRun, StopReason};
pub use sequential::{ErrorStrategy, PipelineRun, SequentialPattern};
pub use swarm::{Handoff, SwarmPattern, SwarmRun};
pub use vote::{VotingInput, VotingResult, VotingStrategy};

/// Metadata key naming the pattern that produced a message.
pub const PATTERN_KEY: &str = "pattern";

/// A coordination topology over runtime-registered agents.
#[async_trait]
pub trait Pattern: Send + Sync {
    /// Short kind label, e.g. `"parallel"`.
    fn name(&self) -> &str;

    /// Drive the pattern to one output message or one error.
    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message>;
}

/// Exposes a pattern as an [`Agent`], so patterns can be registered and
/// nested inside other patterns.
pub struct PatternAgent {
    name: String,
    role: String,
    pattern: Arc<dyn Pattern>,
}

impl PatternAgent {
    pub fn new(name: impl Into<String>, pattern: Arc<dyn Pattern>) -> Self {
        let role = pattern.name().to_string();
        Self {
            name: name.into(),
            role,
            pattern,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

#[async_trait]
impl Agent for PatternAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        self.pattern.execute(ctx, input).await
    }
}

/// Wait for a slot on a pattern-local semaphore, giving up when the context
/// is done.
pub(crate) async fn acquire_slot<'a>(
    ctx: &CallContext,
    semaphore: &'a Semaphore,
) -> Result<SemaphorePermit<'a>> {
    ctx.check()?;
    tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        permit = semaphore.acquire() => {
            permit.map_err(|_| Error::Internal("concurrency limiter closed".into()))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_helpers;
