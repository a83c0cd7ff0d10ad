//! Retrieval-augmented generation with rank fusion.
//!
//! ```text
//!  Basic:        query ─► retriever ─► [reranker] ─► generator
//!  MultiQuery:   query ─► expander ─► retriever × N ─► RRF ─► [reranker] ─► generator
//!  Hybrid:       query ─┬► retriever ─────────┐
//!                       └► keyword retriever ─┴► RRF ─► [reranker] ─► generator
//! ```
//!
//! Retrievers reply with a ranked document list: a JSON array of strings or
//! `{id, content, score}` objects, or plain text with one document per line.
//! Documents are identified by `id` when given and by content otherwise.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use troupe_config::RagConfig;
use troupe_core::{CallContext, Error, Message, Metadata, PatternError, Result, Value};
use troupe_runtime::Runtime;

use crate::{PATTERN_KEY, Pattern};

/// A retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    /// Retriever score, or the fused score after rank fusion.
    #[serde(default)]
    pub score: f64,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: content.clone(),
            content,
            score: 0.0,
        }
    }
}

/// Parse a retriever or reranker reply into a ranked document list.
pub fn parse_documents(payload: &str) -> Vec<Document> {
    if let Ok(serde_json::Value::Array(items)) =
        serde_json::from_str::<serde_json::Value>(payload.trim())
    {
        return items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(Document::new(s)),
                serde_json::Value::Object(obj) => {
                    let text = |key: &str| obj.get(key).and_then(|v| v.as_str());
                    let content = text("content").or_else(|| text("text"))?.to_string();
                    Some(Document {
                        id: text("id").map(str::to_string).unwrap_or_else(|| content.clone()),
                        score: obj.get("score").and_then(|v| v.as_f64()).unwrap_or_default(),
                        content,
                    })
                }
                _ => None,
            })
            .collect();
    }

    payload
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Document::new)
        .collect()
}

/// Fuse ranked lists with reciprocal-rank fusion.
///
/// Each occurrence adds `1 / (k + rank)` with 1-based rank. Results are sorted
/// by fused score, ties broken by first appearance, and truncated to `top_k`.
pub fn reciprocal_rank_fusion(lists: &[Vec<Document>], k: u32, top_k: usize) -> Vec<Document> {
    let mut fused: Vec<Document> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for list in lists {
        for (rank, doc) in list.iter().enumerate() {
            let contribution = 1.0 / (f64::from(k) + rank as f64 + 1.0);
            match index.get(&doc.id) {
                Some(&i) => fused[i].score += contribution,
                None => {
                    index.insert(doc.id.clone(), fused.len());
                    fused.push(Document {
                        score: contribution,
                        ..doc.clone()
                    });
                }
            }
        }
    }

    // Stable sort keeps first-appearance order among equal scores.
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused.truncate(top_k);
    fused
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RagMode {
    #[default]
    Basic,
    MultiQuery,
    Hybrid,
}

impl RagMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RagMode::Basic => "basic",
            RagMode::MultiQuery => "multi_query",
            RagMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for RagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RagMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "basic" => Ok(RagMode::Basic),
            "multi_query" | "multiquery" => Ok(RagMode::MultiQuery),
            "hybrid" => Ok(RagMode::Hybrid),
            other => Err(Error::config(format!("unknown RAG mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub query: String,
    pub answer: String,
}

/// Bounded conversation memory.
#[derive(Debug)]
struct History {
    turns: VecDeque<ConversationTurn>,
    window: usize,
    capacity: usize,
}

impl History {
    /// The last `window` turns as a prompt prefix, or `None` when empty.
    fn digest(&self) -> Option<String> {
        if self.turns.is_empty() || self.window == 0 {
            return None;
        }
        let skip = self.turns.len().saturating_sub(self.window);
        let lines = self
            .turns
            .iter()
            .skip(skip)
            .map(|t| format!("User: {}\nAssistant: {}", t.query, t.answer))
            .collect::<Vec<_>>()
            .join("\n");
        Some(lines)
    }

    fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
pub struct RagRun {
    /// The query used for retrieval, including any conversation digest.
    pub query: String,
    /// Queries actually retrieved; more than one in multi-query mode.
    pub queries: Vec<String>,
    pub documents: Vec<Document>,
    pub output: Message,
}

pub struct RagPattern {
    runtime: Arc<dyn Runtime>,
    retriever: String,
    generator: String,
    mode: RagMode,
    expander: Option<String>,
    keyword_retriever: Option<String>,
    reranker: Option<String>,
    top_k: usize,
    rrf_k: u32,
    max_queries: usize,
    history_window: usize,
    history_capacity: usize,
    history: Option<Mutex<History>>,
}

impl RagPattern {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        retriever: impl Into<String>,
        generator: impl Into<String>,
    ) -> Self {
        let defaults = RagConfig::default();
        Self {
            runtime,
            retriever: retriever.into(),
            generator: generator.into(),
            mode: RagMode::Basic,
            expander: None,
            keyword_retriever: None,
            reranker: None,
            top_k: defaults.top_k,
            rrf_k: defaults.rrf_k,
            max_queries: defaults.max_queries,
            history_window: defaults.history_window,
            history_capacity: defaults.history_capacity,
            history: None,
        }
    }

    /// Takes the numeric settings from `config`. Conversation memory stays
    /// off until [`conversational`](Self::conversational) is called, which
    /// then uses the configured window and capacity.
    pub fn from_config(
        runtime: Arc<dyn Runtime>,
        retriever: impl Into<String>,
        generator: impl Into<String>,
        config: &RagConfig,
    ) -> Self {
        let mut pattern = Self::new(runtime, retriever, generator);
        pattern.top_k = config.top_k.max(1);
        pattern.rrf_k = config.rrf_k;
        pattern.max_queries = config.max_queries.max(1);
        pattern.history_window = config.history_window;
        pattern.history_capacity = config.history_capacity.max(1);
        pattern
    }

    /// Expand the query into variants with `expander` and fuse per-variant
    /// retrievals.
    pub fn multi_query(mut self, expander: impl Into<String>) -> Self {
        self.mode = RagMode::MultiQuery;
        self.expander = Some(expander.into());
        self
    }

    /// Run `keyword_retriever` alongside the main retriever and fuse both.
    pub fn hybrid(mut self, keyword_retriever: impl Into<String>) -> Self {
        self.mode = RagMode::Hybrid;
        self.keyword_retriever = Some(keyword_retriever.into());
        self
    }

    pub fn with_reranker(mut self, reranker: impl Into<String>) -> Self {
        self.reranker = Some(reranker.into());
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_max_queries(mut self, max_queries: usize) -> Self {
        self.max_queries = max_queries.max(1);
        self
    }

    /// Remember turns; the last `history_window` are folded into each query
    /// and at most `history_capacity` are kept.
    pub fn conversational(mut self) -> Self {
        self.history = Some(Mutex::new(History {
            turns: VecDeque::new(),
            window: self.history_window,
            capacity: self.history_capacity,
        }));
        self
    }

    /// Like [`conversational`](Self::conversational) with explicit limits.
    pub fn with_history(mut self, window: usize, capacity: usize) -> Self {
        self.history_window = window;
        self.history_capacity = capacity.max(1);
        self.conversational()
    }

    pub fn mode(&self) -> RagMode {
        self.mode
    }

    /// Snapshot of the remembered turns, oldest first.
    pub async fn history(&self) -> Vec<ConversationTurn> {
        match &self.history {
            Some(history) => history.lock().await.turns.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn run(&self, ctx: &CallContext, input: Message) -> Result<RagRun> {
        let query = match &self.history {
            Some(history) => match history.lock().await.digest() {
                Some(digest) => format!(
                    "Conversation so far:\n{digest}\n\nCurrent question: {}",
                    input.payload
                ),
                None => input.payload.clone(),
            },
            None => input.payload.clone(),
        };

        // ── Retrieve ──
        let (queries, mut documents, retrieved_meta) = match self.mode {
            RagMode::Basic => {
                let reply = self
                    .runtime
                    .call(ctx, &self.retriever, input.derive(query.clone()))
                    .await?;
                let mut docs = parse_documents(&reply.payload);
                docs.truncate(self.top_k);
                (vec![query.clone()], docs, reply.metadata)
            }
            RagMode::MultiQuery => self.retrieve_multi_query(ctx, &input, &query).await?,
            RagMode::Hybrid => self.retrieve_hybrid(ctx, &input, &query).await?,
        };
        debug!(mode = %self.mode, documents = documents.len(), "RAG: retrieved");

        // ── Rerank ──
        if let Some(reranker) = &self.reranker {
            let listing = serde_json::to_string(&documents)?;
            let reply = self
                .runtime
                .call(
                    ctx,
                    reranker,
                    input.derive(listing).with_metadata("query", query.as_str()),
                )
                .await?;
            let reranked = parse_documents(&reply.payload);
            if reranked.is_empty() {
                warn!(reranker = %reranker, "RAG: reranker returned no documents, keeping fused order");
            } else {
                documents = reranked;
                documents.truncate(self.top_k);
            }
        }

        // ── Generate ──
        let context = documents
            .iter()
            .enumerate()
            .map(|(i, d)| format!("[{}] {}", i + 1, d.content))
            .collect::<Vec<_>>()
            .join("\n");
        let generator_input = input
            .derive(format!("Context:\n{context}\n\nQuery:\n{}", input.payload))
            .with_metadata("retrieved_context", retrieved_meta)
            .with_metadata("documents", documents.len());
        let output = self
            .runtime
            .call(ctx, &self.generator, generator_input)
            .await?;

        if let Some(history) = &self.history {
            history.lock().await.push(ConversationTurn {
                query: input.payload.clone(),
                answer: output.payload.clone(),
            });
        }

        Ok(RagRun {
            query,
            queries,
            documents,
            output,
        })
    }

    async fn retrieve_multi_query(
        &self,
        ctx: &CallContext,
        input: &Message,
        query: &str,
    ) -> Result<(Vec<String>, Vec<Document>, Metadata)> {
        let expander = self.expander.as_deref().ok_or_else(|| {
            PatternError::InvalidConfiguration("multi-query RAG needs an expander".into())
        })?;
        let reply = self
            .runtime
            .call(ctx, expander, input.derive(query))
            .await?;

        let mut seen = HashSet::new();
        let queries: Vec<String> = std::iter::once(query.to_string())
            .chain(parse_queries(&reply.payload))
            .filter(|q| seen.insert(q.clone()))
            .take(self.max_queries)
            .collect();

        let calls = queries.iter().enumerate().map(|(i, q)| {
            let msg = input.derive(q.clone()).with_metadata("query_index", i);
            self.runtime.call(ctx, &self.retriever, msg)
        });
        let replies = join_all(calls).await;

        let mut lists = Vec::new();
        let mut meta = Metadata::new();
        let mut failures = Vec::new();
        for (q, reply) in queries.iter().zip(replies) {
            match reply {
                Ok(reply) => {
                    meta.extend(&reply.metadata);
                    lists.push(parse_documents(&reply.payload));
                }
                Err(e) => {
                    warn!(query = %q, error = %e, "RAG: retrieval failed for query variant");
                    failures.push(format!("{q}: {e}"));
                }
            }
        }
        if lists.is_empty() {
            return Err(PatternError::AllAgentsFailed {
                count: failures.len(),
                summary: failures.join("; "),
            }
            .into());
        }

        let documents = reciprocal_rank_fusion(&lists, self.rrf_k, self.top_k);
        Ok((queries, documents, meta))
    }

    async fn retrieve_hybrid(
        &self,
        ctx: &CallContext,
        input: &Message,
        query: &str,
    ) -> Result<(Vec<String>, Vec<Document>, Metadata)> {
        let keyword = self.keyword_retriever.as_deref().ok_or_else(|| {
            PatternError::InvalidConfiguration("hybrid RAG needs a keyword retriever".into())
        })?;
        let (semantic, lexical) = tokio::join!(
            self.runtime
                .call(ctx, &self.retriever, input.derive(query).with_metadata("retrieval", "semantic")),
            self.runtime
                .call(ctx, keyword, input.derive(query).with_metadata("retrieval", "keyword")),
        );

        let mut lists = Vec::new();
        let mut meta = Metadata::new();
        let mut failures = Vec::new();
        for (name, reply) in [(self.retriever.as_str(), semantic), (keyword, lexical)] {
            match reply {
                Ok(reply) => {
                    meta.extend(&reply.metadata);
                    lists.push(parse_documents(&reply.payload));
                }
                Err(e) => {
                    warn!(retriever = %name, error = %e, "RAG: hybrid retriever failed, using the other list");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }
        if lists.is_empty() {
            return Err(PatternError::AllAgentsFailed {
                count: failures.len(),
                summary: failures.join("; "),
            }
            .into());
        }

        let documents = reciprocal_rank_fusion(&lists, self.rrf_k, self.top_k);
        Ok((vec![query.to_string()], documents, meta))
    }
}

/// Query variants from an expander reply: a JSON array of strings, or one
/// per line with list markers stripped.
fn parse_queries(payload: &str) -> Vec<String> {
    if let Ok(items) = serde_json::from_str::<Vec<String>>(payload.trim()) {
        return items
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
    }
    payload
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*'))
                .trim()
                .to_string()
        })
        .filter(|q| !q.is_empty())
        .collect()
}

#[async_trait]
impl Pattern for RagPattern {
    fn name(&self) -> &str {
        "rag"
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        info!(mode = %self.mode, retriever = %self.retriever, "RAG: starting");
        let run = self.run(ctx, input).await?;
        info!(
            queries = run.queries.len(),
            documents = run.documents.len(),
            "RAG: complete"
        );

        let sources = run
            .documents
            .iter()
            .map(|d| Value::from(d.id.as_str()))
            .collect::<Vec<_>>();
        Ok(run
            .output
            .with_metadata(PATTERN_KEY, "rag")
            .with_metadata("mode", self.mode.as_str())
            .with_metadata("documents", sources.len())
            .with_metadata("sources", sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FailingAgent, FnAgent, ScriptedAgent, started_runtime};
    use troupe_core::Agent;

    fn docs(ids: &[&str]) -> Vec<Document> {
        ids.iter().map(|id| Document::new(*id)).collect()
    }

    fn ids(documents: &[Document]) -> Vec<&str> {
        documents.iter().map(|d| d.id.as_str()).collect()
    }

    /// Replies with a fixed document listing and tags its metadata.
    fn retriever(name: &'static str, listing: &'static str) -> Arc<dyn Agent> {
        FnAgent::shared(name, move |_| {
            Ok(Message::response(listing).with_metadata("index", name))
        })
    }

    /// Echoes its whole input so tests can inspect the prompt.
    fn generator() -> Arc<dyn Agent> {
        FnAgent::shared("gen", |msg| Ok(Message::response(msg.payload.clone())))
    }

    #[test]
    fn fusion_ranks_shared_document_first() {
        let fused = reciprocal_rank_fusion(&[docs(&["d1", "d2"]), docs(&["d2", "d3"])], 60, 5);
        assert_eq!(ids(&fused), vec!["d2", "d1", "d3"]);
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn fusion_truncates_to_top_k() {
        let fused = reciprocal_rank_fusion(&[docs(&["a", "b", "c", "d"])], 60, 2);
        assert_eq!(ids(&fused), vec!["a", "b"]);
    }

    #[test]
    fn parses_json_and_plain_listings() {
        let parsed = parse_documents(r#"[{"id": "x", "text": "alpha", "score": 0.3}, "beta", 7]"#);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "x");
        assert_eq!(parsed[0].content, "alpha");
        assert_eq!(parsed[1].id, "beta");

        let lines = parse_documents("first\n\n  second  \n");
        assert_eq!(ids(&lines), vec!["first", "second"]);
    }

    #[test]
    fn expander_list_markers_are_stripped() {
        let queries = parse_queries("1. rust async\n- tokio runtime\n\n* futures");
        assert_eq!(queries, vec!["rust async", "tokio runtime", "futures"]);
    }

    #[tokio::test]
    async fn basic_builds_context_and_keeps_metadata() {
        let runtime =
            started_runtime(vec![retriever("ret", "doc one\ndoc two"), generator()]).await;
        let pattern = RagPattern::new(runtime, "ret", "gen");

        let input = Message::request("what?").with_metadata("session", "s1");
        let out = pattern.execute(&CallContext::new(), input).await.unwrap();

        assert_eq!(out.payload, "Context:\n[1] doc one\n[2] doc two\n\nQuery:\nwhat?");
        assert_eq!(out.metadata.get_str("mode"), Some("basic"));
        assert_eq!(out.metadata.get_f64("documents"), Some(2.0));
    }

    #[tokio::test]
    async fn generator_sees_namespaced_retrieval_metadata() {
        let gen_agent = ScriptedAgent::texts("gen", &["answer"]);
        let runtime =
            started_runtime(vec![retriever("ret", "d"), gen_agent.agent()]).await;
        let pattern = RagPattern::new(runtime, "ret", "gen");

        pattern
            .run(&CallContext::new(), Message::request("q").with_metadata("user", "u1"))
            .await
            .unwrap();
        let seen = &gen_agent.inputs()[0];
        assert_eq!(seen.metadata.get_str("user"), Some("u1"));
        let retrieved = seen.metadata.get_map("retrieved_context").unwrap();
        assert_eq!(retrieved["index"], Value::from("ret"));
        assert!(seen.metadata.get("index").is_none());
    }

    #[tokio::test]
    async fn multi_query_fuses_variant_lists() {
        let expander = FnAgent::shared("expand", |_| Ok(Message::response("variant")));
        let ret = FnAgent::shared("ret", |msg| {
            let listing = if msg.payload == "variant" { "d2\nd3" } else { "d1\nd2" };
            Ok(Message::response(listing))
        });
        let runtime = started_runtime(vec![expander, ret, generator()]).await;
        let pattern = RagPattern::new(runtime, "ret", "gen").multi_query("expand");

        let run = pattern
            .run(&CallContext::new(), Message::request("original"))
            .await
            .unwrap();
        assert_eq!(run.queries, vec!["original", "variant"]);
        assert_eq!(ids(&run.documents), vec!["d2", "d1", "d3"]);
    }

    #[tokio::test]
    async fn multi_query_caps_variants() {
        let expander = FnAgent::shared("expand", |_| Ok(Message::response("a\nb\nc\nd\ne")));
        let ret = FnAgent::shared("ret", |msg| Ok(Message::response(msg.payload.clone())));
        let runtime = started_runtime(vec![expander, ret, generator()]).await;
        let pattern = RagPattern::new(runtime, "ret", "gen")
            .multi_query("expand")
            .with_max_queries(3);

        let run = pattern
            .run(&CallContext::new(), Message::request("q"))
            .await
            .unwrap();
        assert_eq!(run.queries, vec!["q", "a", "b"]);
    }

    #[tokio::test]
    async fn hybrid_fuses_both_retrievers() {
        let runtime = started_runtime(vec![
            retriever("semantic", "d1\nd2"),
            retriever("keyword", "d2\nd3"),
            generator(),
        ])
        .await;
        let pattern = RagPattern::new(runtime, "semantic", "gen").hybrid("keyword");

        let run = pattern
            .run(&CallContext::new(), Message::request("q"))
            .await
            .unwrap();
        assert_eq!(ids(&run.documents), vec!["d2", "d1", "d3"]);
    }

    #[tokio::test]
    async fn hybrid_degrades_to_one_retriever() {
        let runtime = started_runtime(vec![
            retriever("semantic", "d1\nd2"),
            FailingAgent::shared("keyword"),
            generator(),
        ])
        .await;
        let pattern = RagPattern::new(runtime, "semantic", "gen").hybrid("keyword");

        let run = pattern
            .run(&CallContext::new(), Message::request("q"))
            .await
            .unwrap();
        assert_eq!(ids(&run.documents), vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn hybrid_fails_when_both_retrievers_fail() {
        let runtime = started_runtime(vec![
            FailingAgent::shared("semantic"),
            FailingAgent::shared("keyword"),
            generator(),
        ])
        .await;
        let pattern = RagPattern::new(runtime, "semantic", "gen").hybrid("keyword");

        let err = pattern
            .run(&CallContext::new(), Message::request("q"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pattern(PatternError::AllAgentsFailed { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn reranker_reorders_documents() {
        let reranker = FnAgent::shared("rerank", |msg| {
            let mut listed: Vec<Document> = serde_json::from_str(&msg.payload).unwrap();
            listed.reverse();
            Ok(Message::response(serde_json::to_string(&listed).unwrap()))
        });
        let runtime =
            started_runtime(vec![retriever("ret", "a\nb\nc"), reranker, generator()]).await;
        let pattern = RagPattern::new(runtime, "ret", "gen").with_reranker("rerank");

        let run = pattern
            .run(&CallContext::new(), Message::request("q"))
            .await
            .unwrap();
        assert_eq!(ids(&run.documents), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn conversation_history_is_windowed_and_capped() {
        let ret = ScriptedAgent::texts("ret", &["d", "d", "d", "d"]);
        let runtime = started_runtime(vec![ret.agent(), generator()]).await;
        let pattern = RagPattern::new(runtime, "ret", "gen").with_history(1, 2);

        for q in ["one", "two", "three"] {
            pattern
                .run(&CallContext::new(), Message::request(q))
                .await
                .unwrap();
        }
        let run = pattern
            .run(&CallContext::new(), Message::request("four"))
            .await
            .unwrap();

        assert!(run.query.starts_with("Conversation so far:\nUser: three\n"));
        assert!(!run.query.contains("User: two"));
        assert!(run.query.ends_with("Current question: four"));
        assert_eq!(ret.inputs()[0].payload, "one");

        let kept: Vec<String> = pattern.history().await.into_iter().map(|t| t.query).collect();
        assert_eq!(kept, vec!["three", "four"]);
    }

    #[tokio::test]
    async fn configured_history_limits_apply() {
        let ret = ScriptedAgent::texts("ret", &["d", "d", "d"]);
        let runtime = started_runtime(vec![ret.agent(), generator()]).await;
        let config = RagConfig {
            history_window: 1,
            history_capacity: 2,
            ..RagConfig::default()
        };
        let pattern = RagPattern::from_config(runtime, "ret", "gen", &config).conversational();

        for q in ["one", "two"] {
            pattern
                .run(&CallContext::new(), Message::request(q))
                .await
                .unwrap();
        }
        let run = pattern
            .run(&CallContext::new(), Message::request("three"))
            .await
            .unwrap();

        assert!(run.query.contains("User: two"));
        assert!(!run.query.contains("User: one"));
        let kept: Vec<String> = pattern.history().await.into_iter().map(|t| t.query).collect();
        assert_eq!(kept, vec!["two", "three"]);
    }
}
