//! MapReduce pattern.
//!
//! The input is split into independent chunks, each chunk is mapped through
//! the same agent under bounded concurrency, and the per-chunk results are
//! reduced into one output.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};
use troupe_config::MapReduceConfig;
use troupe_core::{CallContext, Message, PatternError, Result};
use troupe_runtime::{ExecutionResult, Runtime};

use crate::{PATTERN_KEY, Pattern, acquire_slot};

/// Splits an input payload into chunks.
pub type SplitFn = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Reduces chunk outcomes, in chunk order, into one payload.
pub type ReduceFn = Arc<dyn Fn(&[ChunkOutcome]) -> Result<String> + Send + Sync>;

/// One mapped chunk.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub index: usize,
    pub chunk: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone)]
pub struct MapReduceRun {
    pub chunks: Vec<ChunkOutcome>,
    pub output: String,
}

impl MapReduceRun {
    pub fn failed(&self) -> usize {
        self.chunks.iter().filter(|c| !c.result.is_success()).count()
    }
}

/// Split on blank lines, dropping empty paragraphs.
pub fn paragraph_splitter(input: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in input.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                chunks.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    chunks
}

/// Newline-join successful outputs, skipping failures.
pub fn join_reducer(chunks: &[ChunkOutcome]) -> Result<String> {
    Ok(chunks
        .iter()
        .filter(|c| c.result.is_success())
        .map(|c| c.result.output.as_str())
        .collect::<Vec<_>>()
        .join("\n"))
}

pub struct MapReducePattern {
    runtime: Arc<dyn Runtime>,
    mapper: String,
    concurrency: usize,
    splitter: SplitFn,
    reducer: ReduceFn,
}

impl MapReducePattern {
    pub fn new(runtime: Arc<dyn Runtime>, mapper: impl Into<String>) -> Self {
        Self {
            runtime,
            mapper: mapper.into(),
            concurrency: MapReduceConfig::default().concurrency,
            splitter: Arc::new(paragraph_splitter),
            reducer: Arc::new(join_reducer),
        }
    }

    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        mapper: impl Into<String>,
        config: &MapReduceConfig,
    ) -> Self {
        Self::new(runtime, mapper).with_concurrency(config.concurrency)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_splitter(mut self, splitter: SplitFn) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn with_reducer(mut self, reducer: ReduceFn) -> Self {
        self.reducer = reducer;
        self
    }

    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<MapReduceRun> {
        let chunks = (self.splitter)(&input.payload);
        let semaphore = Semaphore::new(self.concurrency);

        let mapped = chunks.iter().enumerate().map(|(index, chunk)| {
            let semaphore = &semaphore;
            let msg = input
                .derive(chunk.clone())
                .with_metadata("chunk_index", index)
                .with_metadata("chunk_count", chunks.len());
            async move {
                let started = Instant::now();
                let outcome = match acquire_slot(ctx, semaphore).await {
                    Ok(_permit) => self.runtime.call(ctx, &self.mapper, msg).await,
                    Err(e) => Err(e),
                };
                let result = match outcome {
                    Ok(reply) => ExecutionResult::success(&self.mapper, reply, started.elapsed()),
                    Err(e) => {
                        warn!(chunk = index, error = %e, "MapReduce: chunk failed");
                        ExecutionResult::failure(&self.mapper, &e, started.elapsed())
                    }
                };
                ChunkOutcome {
                    index,
                    chunk: chunk.clone(),
                    result,
                }
            }
        });
        let outcomes = join_all(mapped).await;

        if !outcomes.is_empty() && outcomes.iter().all(|c| !c.result.is_success()) {
            let summary = outcomes
                .iter()
                .map(|c| {
                    format!(
                        "chunk {}: {}",
                        c.index,
                        c.result.error.as_deref().unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PatternError::AllAgentsFailed {
                count: outcomes.len(),
                summary,
            }
            .into());
        }

        let output = (self.reducer)(&outcomes)?;
        Ok(MapReduceRun {
            chunks: outcomes,
            output,
        })
    }
}

#[async_trait]
impl Pattern for MapReducePattern {
    fn name(&self) -> &str {
        "map_reduce"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(mapper = %self.mapper, concurrency = self.concurrency, "MapReduce: starting");
        let run = self.run(ctx, input).await?;
        let failed = run.failed();
        info!(chunks = run.chunks.len(), failed, "MapReduce: complete");

        Ok(Message::response(run.output)
            .with_metadata(PATTERN_KEY, "map_reduce")
            .with_metadata("chunks", run.chunks.len())
            .with_metadata("failed", failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FnAgent, SlowAgent, started_runtime};
    use std::time::Duration;
    use troupe_core::Error;

    fn upper() -> Arc<dyn troupe_core::Agent> {
        FnAgent::shared("upper", |msg| {
            if msg.payload.contains("bad") {
                Err(Error::agent("upper", "refused"))
            } else {
                Ok(Message::response(msg.payload.to_uppercase()))
            }
        })
    }

    #[test]
    fn splits_on_blank_lines() {
        let chunks = paragraph_splitter("one\ntwo\n\n\nthree\n  \nfour");
        assert_eq!(chunks, vec!["one\ntwo", "three", "four"]);
        assert!(paragraph_splitter("   \n").is_empty());
    }

    #[tokio::test]
    async fn maps_and_reduces_in_chunk_order() {
        let runtime = started_runtime(vec![upper()]).await;
        let pattern = MapReducePattern::new(runtime, "upper");

        let out = pattern
            .execute(&CallContext::new(), Message::request("alpha\n\nbeta\n\ngamma"))
            .await
            .unwrap();
        assert_eq!(out.payload, "ALPHA\nBETA\nGAMMA");
        assert_eq!(out.metadata.get_f64("chunks"), Some(3.0));
    }

    #[tokio::test]
    async fn reducer_skips_failed_chunks() {
        let runtime = started_runtime(vec![upper()]).await;
        let pattern = MapReducePattern::new(runtime, "upper");

        let run = pattern
            .run(&CallContext::new(), Message::request("ok\n\nbad\n\nfine"))
            .await
            .unwrap();
        assert_eq!(run.output, "OK\nFINE");
        assert_eq!(run.failed(), 1);
        assert_eq!(run.chunks[1].chunk, "bad");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let runtime =
            started_runtime(vec![SlowAgent::shared("slow", Duration::from_millis(100))]).await;
        let pattern = MapReducePattern::new(runtime, "slow").with_concurrency(2);

        let started = Instant::now();
        let run = pattern
            .run(&CallContext::new(), Message::request("a\n\nb\n\nc\n\nd"))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(run.chunks.len(), 4);
        assert!(elapsed >= Duration::from_millis(200), "took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn custom_splitter_and_reducer() {
        let runtime = started_runtime(vec![upper()]).await;
        let pattern = MapReducePattern::new(runtime, "upper")
            .with_splitter(Arc::new(|input: &str| {
                input.split(',').map(str::to_string).collect::<Vec<_>>()
            }))
            .with_reducer(Arc::new(|chunks: &[ChunkOutcome]| -> Result<String> {
                Ok(chunks
                    .iter()
                    .map(|c| c.result.output.clone())
                    .collect::<Vec<_>>()
                    .join("|"))
            }));

        let out = pattern
            .execute(&CallContext::new(), Message::request("x,y"))
            .await
            .unwrap();
        assert_eq!(out.payload, "X|Y");
    }

    #[tokio::test]
    async fn every_chunk_failing_is_an_error() {
        let runtime = started_runtime(vec![upper()]).await;
        let pattern = MapReducePattern::new(runtime, "upper");
        let err = pattern
            .run(&CallContext::new(), Message::request("bad\n\nbad too"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pattern(PatternError::AllAgentsFailed { count: 2, .. })
        ));
    }
}
