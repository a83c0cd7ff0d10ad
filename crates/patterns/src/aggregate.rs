//! Aggregation functions for fan-out results.
//!
//! An aggregator folds the successful part of a [`ParallelResults`] into one
//! message. Failures are visible to the aggregator but ignored by the built-in
//! ones.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use troupe_core::{Error, Message, PatternError, Result, Value};
use troupe_runtime::ParallelResults;

use crate::vote::{self, VotingInput};

/// Pluggable fold from fan-out results to one message.
pub type AggregateFn = Arc<dyn Fn(&ParallelResults) -> Result<Message> + Send + Sync>;

/// Built-in aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregation {
    /// JSON object mapping agent name to output.
    #[default]
    Merge,
    /// Outputs joined by newlines, in agent-name order.
    Concat,
    /// The output that finished first.
    FirstSuccess,
    /// Majority vote over identical content.
    Majority,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Merge => "merge",
            Aggregation::Concat => "concat",
            Aggregation::FirstSuccess => "first_success",
            Aggregation::Majority => "majority",
        }
    }

    pub fn into_fn(self) -> AggregateFn {
        match self {
            Aggregation::Merge => Arc::new(merge),
            Aggregation::Concat => Arc::new(concat),
            Aggregation::FirstSuccess => Arc::new(first_success),
            Aggregation::Majority => Arc::new(majority),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "merge" => Ok(Aggregation::Merge),
            "concat" | "concatenate" => Ok(Aggregation::Concat),
            "first" | "first_success" => Ok(Aggregation::FirstSuccess),
            "majority" | "vote" => Ok(Aggregation::Majority),
            other => Err(Error::config(format!("unknown aggregation '{other}'"))),
        }
    }
}

fn require_successes(results: &ParallelResults) -> Result<()> {
    if results.all_failed() {
        return Err(PatternError::AllAgentsFailed {
            count: results.errors.len(),
            summary: results.failure_summary(),
        }
        .into());
    }
    Ok(())
}

fn sources(results: &ParallelResults) -> Value {
    Value::List(
        results
            .successes
            .keys()
            .map(|name| Value::from(name.as_str()))
            .collect(),
    )
}

/// Structured composite: `{"agent": "output", ...}`.
pub fn merge(results: &ParallelResults) -> Result<Message> {
    require_successes(results)?;
    let composite: BTreeMap<&str, &str> = results
        .successes
        .iter()
        .map(|(name, result)| (name.as_str(), result.output.as_str()))
        .collect();
    let payload = serde_json::to_string(&composite)?;
    Ok(Message::response(payload).with_metadata("sources", sources(results)))
}

pub fn concat(results: &ParallelResults) -> Result<Message> {
    require_successes(results)?;
    let payload = results
        .successes
        .values()
        .map(|result| result.output.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Message::response(payload).with_metadata("sources", sources(results)))
}

/// The earliest finisher, metadata included.
pub fn first_success(results: &ParallelResults) -> Result<Message> {
    require_successes(results)?;
    let first = results
        .successes_in_completion_order()
        .into_iter()
        .next()
        .ok_or_else(|| Error::Internal("completion order lost a success".into()))?;
    Ok(first
        .to_message()
        .with_metadata("source", first.agent.as_str()))
}

pub fn majority(results: &ParallelResults) -> Result<Message> {
    require_successes(results)?;
    let inputs: Vec<VotingInput> = results
        .successes
        .values()
        .map(VotingInput::from_result)
        .collect();
    let outcome = vote::majority_vote(&inputs)?;
    Ok(Message::response(outcome.content)
        .with_metadata("agreement", outcome.agreement)
        .with_metadata("explanation", outcome.explanation)
        .with_metadata("sources", sources(results)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn results(entries: &[(&str, std::result::Result<&str, &str>)]) -> ParallelResults {
        let mut results = ParallelResults::new();
        for (name, outcome) in entries {
            let outcome = match outcome {
                Ok(text) => Ok(Message::response(*text)),
                Err(reason) => Err(Error::agent(*name, *reason)),
            };
            results.record(name.to_string(), outcome, Duration::ZERO);
        }
        results
    }

    #[test]
    fn merge_builds_json_object() {
        let r = results(&[("b", Ok("two")), ("a", Ok("one")), ("c", Err("down"))]);
        let msg = merge(&r).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(parsed, serde_json::json!({"a": "one", "b": "two"}));
        assert_eq!(msg.metadata.get_list("sources").unwrap().len(), 2);
    }

    #[test]
    fn concat_orders_by_name() {
        let r = results(&[("b", Ok("second")), ("a", Ok("first"))]);
        assert_eq!(concat(&r).unwrap().payload, "first\nsecond");
    }

    #[test]
    fn first_success_follows_completion_order() {
        let r = results(&[("slow", Err("x")), ("zed", Ok("fast")), ("amy", Ok("late"))]);
        let msg = first_success(&r).unwrap();
        assert_eq!(msg.payload, "fast");
        assert_eq!(msg.metadata.get_str("source"), Some("zed"));
    }

    #[test]
    fn majority_reports_agreement() {
        let r = results(&[("a", Ok("4")), ("b", Ok("4")), ("c", Ok("5"))]);
        let msg = majority(&r).unwrap();
        assert_eq!(msg.payload, "4");
        let agreement = msg.metadata.get_f64("agreement").unwrap();
        assert!((agreement - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn every_aggregation_rejects_total_failure() {
        let r = results(&[("a", Err("x")), ("b", Err("y"))]);
        for aggregation in [
            Aggregation::Merge,
            Aggregation::Concat,
            Aggregation::FirstSuccess,
            Aggregation::Majority,
        ] {
            let err = (aggregation.into_fn())(&r).unwrap_err();
            assert!(matches!(
                err,
                Error::Pattern(PatternError::AllAgentsFailed { count: 2, .. })
            ));
        }
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("first".parse::<Aggregation>().unwrap(), Aggregation::FirstSuccess);
        assert_eq!("MERGE".parse::<Aggregation>().unwrap(), Aggregation::Merge);
        assert!("average".parse::<Aggregation>().is_err());
    }
}
