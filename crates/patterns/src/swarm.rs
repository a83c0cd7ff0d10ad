//! Swarm pattern: decentralized handoffs.
//!
//! There is no coordinator. The entry agent answers, and may hand the
//! conversation to a peer by naming it in its reply. The chain ends when an
//! agent answers without a handoff, or fails once `max_handoffs` is spent.
//!
//! A reply requests a handoff with any of:
//!
//! - metadata `handoff_to` (optional `handoff_input`, `handoff_reason`)
//! - metadata `handoff` map with `target` (or `to`), `input`, `reason`
//! - a payload line `HANDOFF: <agent>`; the rest of the payload becomes the
//!   next input

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use troupe_config::SwarmConfig;
use troupe_core::{CallContext, Message, PatternError, Result, Value};
use troupe_runtime::Runtime;

use crate::{PATTERN_KEY, Pattern};

const HANDOFF_PREFIX: &str = "HANDOFF:";

/// A request from one agent to pass control to another.
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    pub from: String,
    pub target: String,
    /// Input for the target. `None` forwards the current input unchanged.
    pub input: Option<String>,
    pub reason: Option<String>,
}

impl Handoff {
    /// Look for a handoff request in `reply`, sent by `from`.
    pub fn detect(from: &str, reply: &Message) -> Option<Self> {
        let meta = &reply.metadata;
        let handoff = |target: &str, input: Option<&str>, reason: Option<&str>| Handoff {
            from: from.to_string(),
            target: target.trim().to_string(),
            input: input.map(str::to_string),
            reason: reason.map(str::to_string),
        };

        if let Some(target) = meta.get_str("handoff_to")
            && !target.trim().is_empty()
        {
            return Some(handoff(
                target,
                meta.get_str("handoff_input"),
                meta.get_str("handoff_reason"),
            ));
        }

        if let Some(map) = meta.get_map("handoff") {
            let field = |key: &str| map.get(key).and_then(|v| v.as_str());
            if let Some(target) = field("target").or_else(|| field("to"))
                && !target.trim().is_empty()
            {
                return Some(handoff(target, field("input"), field("reason")));
            }
        }

        let mut target = None;
        let mut rest = Vec::new();
        for line in reply.payload.lines() {
            match line.trim().strip_prefix(HANDOFF_PREFIX) {
                Some(name) if target.is_none() && !name.trim().is_empty() => {
                    target = Some(name.trim().to_string());
                }
                _ => rest.push(line),
            }
        }
        let target = target?;
        let rest = rest.join("\n").trim().to_string();
        Some(Handoff {
            from: from.to_string(),
            target,
            input: (!rest.is_empty()).then_some(rest),
            reason: None,
        })
    }
}

/// Where the chain currently is.
#[derive(Debug, Clone)]
struct SwarmState {
    current: String,
    input: Message,
    hops: usize,
}

impl SwarmState {
    /// Move to `handoff.target`, or fail if the hop budget is spent.
    fn advance(&mut self, handoff: &Handoff, max_handoffs: usize) -> Result<()> {
        if self.hops >= max_handoffs {
            return Err(PatternError::MaxHandoffsExceeded { max: max_handoffs }.into());
        }
        self.hops += 1;
        let payload = handoff
            .input
            .clone()
            .unwrap_or_else(|| self.input.payload.clone());
        let mut next = self
            .input
            .derive(payload)
            .with_metadata("handoff_from", handoff.from.as_str())
            .with_metadata("handoff_count", self.hops);
        if let Some(reason) = &handoff.reason {
            next = next.with_metadata("handoff_reason", reason.as_str());
        }
        self.current = handoff.target.clone();
        self.input = next;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SwarmRun {
    /// Every agent that answered, in order. Starts with the entry agent.
    pub path: Vec<String>,
    pub handoffs: Vec<Handoff>,
    pub output: Message,
}

pub struct SwarmPattern {
    runtime: Arc<dyn Runtime>,
    entry: String,
    agents: Vec<String>,
    max_handoffs: usize,
}

impl SwarmPattern {
    /// `agents` are the peers that may receive a handoff. The entry agent is
    /// always a valid target.
    pub fn new(runtime: Arc<dyn Runtime>, entry: impl Into<String>, agents: Vec<String>) -> Self {
        Self {
            runtime,
            entry: entry.into(),
            agents,
            max_handoffs: SwarmConfig::default().max_handoffs,
        }
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        entry: impl Into<String>,
        agents: Vec<String>,
        config: &SwarmConfig,
    ) -> Self {
        Self::new(runtime, entry, agents).with_max_handoffs(config.max_handoffs)
    }

    pub fn with_max_handoffs(mut self, max_handoffs: usize) -> Self {
        self.max_handoffs = max_handoffs;
        self
    }

    fn is_member(&self, name: &str) -> bool {
        name == self.entry || self.agents.iter().any(|a| a == name)
    }

    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<SwarmRun> {
        let mut state = SwarmState {
            current: self.entry.clone(),
            input,
            hops: 0,
        };
        let mut path = Vec::new();
        let mut handoffs = Vec::new();

        loop {
            ctx.check()?;
            let reply = self
                .runtime
                .call(ctx, &state.current, state.input.clone())
                .await?;
            path.push(state.current.clone());

            let Some(handoff) = Handoff::detect(&state.current, &reply) else {
                return Ok(SwarmRun {
                    path,
                    handoffs,
                    output: reply,
                });
            };

            if !self.is_member(&handoff.target) {
                return Err(PatternError::InvalidHandoffTarget {
                    from: handoff.from,
                    target: handoff.target,
                }
                .into());
            }
            debug!(
                from = %handoff.from,
                to = %handoff.target,
                hop = state.hops + 1,
                "Swarm: handoff"
            );
            state.advance(&handoff, self.max_handoffs)?;
            handoffs.push(handoff);
        }
    }
}

#[async_trait]
impl Pattern for SwarmPattern {
    fn name(&self) -> &str {
        "swarm"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(entry = %self.entry, peers = self.agents.len(), "Swarm: starting");
        let run = self.run(ctx, input).await?;
        info!(handoffs = run.handoffs.len(), "Swarm: complete");

        let path = run
            .path
            .iter()
            .map(|p| Value::from(p.as_str()))
            .collect::<Vec<_>>();
        let last = run.path.last().cloned().unwrap_or_default();
        Ok(run
            .output
            .with_metadata(PATTERN_KEY, "swarm")
            .with_metadata("handoffs", run.handoffs.len())
            .with_metadata("final_agent", last)
            .with_metadata("path", path))
    }
}
