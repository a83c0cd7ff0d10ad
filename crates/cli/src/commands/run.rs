//! `troupe run`: run one pattern over registered agents.
//!
//! How `--agents` is read depends on the pattern:
//!
//! | pattern        | agents                                          |
//! |----------------|-------------------------------------------------|
//! | parallel       | every agent                                     |
//! | sequential     | pipeline stages, in order                       |
//! | map-reduce     | the mapper                                      |
//! | ensemble       | every model                                     |
//! | reflection     | generator, critic                               |
//! | hierarchical   | manager, then one single-worker team per agent  |
//! | swarm          | entry agent, then its peers                     |
//! | rag            | retriever, generator, then expander or keyword retriever for `--mode` |
//! | planning       | planner, then an optional validator             |
//!
//! With `--conversational` (rag only), each non-empty input line is one turn
//! and earlier turns are folded into later queries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use troupe_config::{AppConfig, PatternsConfig};
use troupe_core::{AgentDef, CallContext, Error, FactoryRegistry, Message};
use troupe_patterns::{
    EnsemblePattern, HierarchicalPattern, MapReducePattern, ParallelPattern, Pattern,
    PlanningPattern, RagMode, RagPattern, ReflectionPattern, SequentialPattern, SwarmPattern,
    Team,
};
use troupe_runtime::{LocalRuntime, Runtime};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PatternKind {
    Parallel,
    Sequential,
    MapReduce,
    Ensemble,
    Reflection,
    Hierarchical,
    Swarm,
    Rag,
    Planning,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Pattern to run
    #[arg(value_enum)]
    pub pattern: PatternKind,

    /// Comma-separated agent names
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub agents: Vec<String>,

    /// Input text; read from stdin when omitted
    #[arg(short, long)]
    pub input: Option<String>,

    /// Voting strategy for ensemble (majority, unanimous, weighted, confidence)
    #[arg(long)]
    pub strategy: Option<String>,

    /// Aggregation for parallel (merge, concat, first, majority)
    #[arg(long)]
    pub aggregation: Option<String>,

    /// RAG mode (basic, multi-query, hybrid)
    #[arg(long, default_value = "basic")]
    pub mode: String,

    /// Treat each input line as one conversation turn (rag only)
    #[arg(long)]
    pub conversational: bool,

    /// Overall deadline in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Print the whole output message as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(
    config: &AppConfig,
    registry: &FactoryRegistry,
    args: RunArgs,
) -> anyhow::Result<()> {
    let input = match &args.input {
        Some(text) => text.clone(),
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading input from stdin")?;
            text
        }
    };

    if args.conversational && args.pattern != PatternKind::Rag {
        bail!("--conversational only applies to the rag pattern");
    }
    let turns: Vec<String> = if args.conversational {
        input
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        vec![input]
    };

    let runtime = LocalRuntime::new(config.runtime.clone());
    for def in &config.agents {
        let agent = registry
            .create(def)
            .with_context(|| format!("building agent '{}'", def.name))?;
        runtime.register(agent).await?;
    }
    for name in &args.agents {
        if runtime.get(name).await.is_none() {
            debug!(agent = %name, "Not configured, using the echo factory");
            runtime
                .register(registry.create(&AgentDef::new(name.as_str(), "echo"))?)
                .await?;
        }
    }
    runtime.start().await?;

    let shared: Arc<dyn Runtime> = Arc::new(runtime.clone());
    let pattern = build_pattern(shared, &args, &config.patterns)?;
    info!(pattern = pattern.name(), agents = args.agents.len(), "Running");

    let ctx = match args.timeout_ms {
        Some(ms) => CallContext::new().with_timeout(Duration::from_millis(ms)),
        None => CallContext::new(),
    };
    let outcome = ctx
        .run(async {
            let mut outputs = Vec::with_capacity(turns.len());
            for turn in &turns {
                outputs.push(pattern.execute(&ctx, Message::request(turn.as_str())).await?);
            }
            Ok::<_, Error>(outputs)
        })
        .await;

    let stop_ctx = CallContext::new().with_timeout(STOP_GRACE);
    if let Err(e) = runtime.stop(&stop_ctx).await {
        warn!(error = %e, "Runtime did not stop cleanly");
    }

    let outputs = outcome.with_context(|| format!("{} pattern failed", pattern.name()))?;
    for output in &outputs {
        if args.json {
            println!("{}", serde_json::to_string_pretty(output)?);
        } else {
            println!("{}", output.payload);
        }
    }
    Ok(())
}

fn build_pattern(
    runtime: Arc<dyn Runtime>,
    args: &RunArgs,
    patterns: &PatternsConfig,
) -> anyhow::Result<Arc<dyn Pattern>> {
    let agents = &args.agents;
    let pattern: Arc<dyn Pattern> = match args.pattern {
        PatternKind::Parallel => {
            let mut config = patterns.parallel.clone();
            if let Some(aggregation) = &args.aggregation {
                config.aggregation = aggregation.clone();
            }
            Arc::new(ParallelPattern::from_config(runtime, agents.clone(), &config)?)
        }
        PatternKind::Sequential => Arc::new(SequentialPattern::from_config(
            runtime,
            agents.clone(),
            &patterns.sequential,
        )?),
        PatternKind::MapReduce => {
            need(agents, 1, "map-reduce needs a mapper")?;
            Arc::new(MapReducePattern::from_config(
                runtime,
                agents[0].as_str(),
                &patterns.map_reduce,
            ))
        }
        PatternKind::Ensemble => {
            let mut config = patterns.ensemble.clone();
            if let Some(strategy) = &args.strategy {
                config.strategy = strategy.clone();
            }
            Arc::new(EnsemblePattern::from_config(runtime, agents.clone(), &config)?)
        }
        PatternKind::Reflection => {
            need(agents, 2, "reflection needs a generator and a critic")?;
            Arc::new(ReflectionPattern::from_config(
                runtime,
                agents[0].as_str(),
                agents[1].as_str(),
                &patterns.reflection,
            ))
        }
        PatternKind::Hierarchical => {
            need(agents, 2, "hierarchical needs a manager and at least one worker")?;
            let hierarchy = agents[1..].iter().fold(
                HierarchicalPattern::from_config(runtime, agents[0].as_str(), &patterns.hierarchical),
                |hierarchy, worker| hierarchy.with_team(worker.as_str(), Team::worker(worker.as_str())),
            );
            Arc::new(hierarchy)
        }
        PatternKind::Swarm => {
            need(agents, 1, "swarm needs an entry agent")?;
            Arc::new(SwarmPattern::from_config(
                runtime,
                agents[0].as_str(),
                agents[1..].to_vec(),
                &patterns.swarm,
            ))
        }
        PatternKind::Rag => {
            need(agents, 2, "rag needs a retriever and a generator")?;
            let base = RagPattern::from_config(
                runtime,
                agents[0].as_str(),
                agents[1].as_str(),
                &patterns.rag,
            );
            let rag = match args.mode.parse::<RagMode>()? {
                RagMode::Basic => base,
                RagMode::MultiQuery => {
                    need(agents, 3, "multi-query rag needs an expander as third agent")?;
                    base.multi_query(agents[2].as_str())
                }
                RagMode::Hybrid => {
                    need(agents, 3, "hybrid rag needs a keyword retriever as third agent")?;
                    base.hybrid(agents[2].as_str())
                }
            };
            Arc::new(if args.conversational {
                rag.conversational()
            } else {
                rag
            })
        }
        PatternKind::Planning => {
            need(agents, 1, "planning needs a planner")?;
            let planning = PlanningPattern::from_config(runtime, agents[0].as_str(), &patterns.planning);
            Arc::new(match agents.get(1) {
                Some(validator) => planning.with_validator(validator.as_str()),
                None => planning,
            })
        }
    };
    Ok(pattern)
}

fn need(agents: &[String], count: usize, message: &str) -> anyhow::Result<()> {
    if agents.len() < count {
        bail!("{message} (got {} agent(s))", agents.len());
    }
    Ok(())
}
