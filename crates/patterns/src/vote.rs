//! Voting algorithms.
//!
//! Pure functions reducing a set of labeled outputs to one output plus an
//! agreement score in [0, 1]. Inputs are ordered by source name before
//! grouping, so every tie-break is reproducible: among equally supported
//! candidates, the one whose first supporter sorts earliest wins.

use std::fmt;
use std::str::FromStr;

use troupe_core::{Error, Result, VoteError};
use troupe_runtime::ExecutionResult;

/// Confidence assumed when a result carries none.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// One labeled vote.
#[derive(Debug, Clone, PartialEq)]
pub struct VotingInput {
    pub source: String,
    pub content: String,
    pub confidence: f64,
}

impl VotingInput {
    pub fn new(source: impl Into<String>, content: impl Into<String>, confidence: f64) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            confidence,
        }
    }

    /// Build a vote from an agent result, reading `confidence` from its
    /// metadata.
    pub fn from_result(result: &ExecutionResult) -> Self {
        Self::new(
            result.agent.clone(),
            result.output.clone(),
            result
                .metadata
                .get_f64_or("confidence", DEFAULT_CONFIDENCE),
        )
    }
}

/// Outcome of a vote.
#[derive(Debug, Clone, PartialEq)]
pub struct VotingResult {
    pub content: String,
    pub agreement: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VotingStrategy {
    #[default]
    Majority,
    Unanimous,
    Weighted,
    Confidence,
}

impl VotingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingStrategy::Majority => "majority",
            VotingStrategy::Unanimous => "unanimous",
            VotingStrategy::Weighted => "weighted",
            VotingStrategy::Confidence => "confidence",
        }
    }
}

impl fmt::Display for VotingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VotingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "majority" => Ok(VotingStrategy::Majority),
            "unanimous" => Ok(VotingStrategy::Unanimous),
            "weighted" => Ok(VotingStrategy::Weighted),
            "confidence" => Ok(VotingStrategy::Confidence),
            other => Err(Error::config(format!("unknown voting strategy '{other}'"))),
        }
    }
}

/// Run the given strategy.
pub fn vote(strategy: VotingStrategy, inputs: &[VotingInput]) -> Result<VotingResult> {
    match strategy {
        VotingStrategy::Majority => majority_vote(inputs),
        VotingStrategy::Unanimous => unanimous_vote(inputs),
        VotingStrategy::Weighted => weighted_vote(inputs),
        VotingStrategy::Confidence => confidence_vote(inputs),
    }
}

fn sorted_by_source(inputs: &[VotingInput]) -> Result<Vec<&VotingInput>> {
    if inputs.is_empty() {
        return Err(VoteError::NoInputs.into());
    }
    let mut sorted: Vec<&VotingInput> = inputs.iter().collect();
    sorted.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(sorted)
}

/// Sum `weight` per distinct content, keeping first-seen order.
fn tally<'a>(
    sorted: &[&'a VotingInput],
    weight: impl Fn(&VotingInput) -> f64,
) -> Vec<(&'a str, f64, usize)> {
    let mut groups: Vec<(&'a str, f64, usize)> = Vec::new();
    for &input in sorted {
        match groups.iter_mut().find(|group| group.0 == input.content) {
            Some(group) => {
                group.1 += weight(input);
                group.2 += 1;
            }
            None => groups.push((input.content.as_str(), weight(input), 1)),
        }
    }
    groups
}

/// Pick the heaviest group; earlier groups win ties.
fn heaviest<'a>(groups: &[(&'a str, f64, usize)]) -> (&'a str, f64, usize) {
    let mut best = groups[0];
    for group in &groups[1..] {
        if group.1 > best.1 {
            best = *group;
        }
    }
    best
}

/// Most common exact content wins. Agreement is the winning share of votes.
pub fn majority_vote(inputs: &[VotingInput]) -> Result<VotingResult> {
    let sorted = sorted_by_source(inputs)?;
    let groups = tally(&sorted, |_| 1.0);
    let (content, _, count) = heaviest(&groups);
    let total = sorted.len();

    Ok(VotingResult {
        content: content.to_string(),
        agreement: count as f64 / total as f64,
        explanation: format!(
            "{count} of {total} votes agreed ({} distinct answers)",
            groups.len()
        ),
    })
}

/// Every input must carry identical content.
pub fn unanimous_vote(inputs: &[VotingInput]) -> Result<VotingResult> {
    let sorted = sorted_by_source(inputs)?;
    let first = sorted[0];
    if let Some(other) = sorted.iter().find(|i| i.content != first.content) {
        return Err(VoteError::Disagreement {
            first: first.source.clone(),
            second: other.source.clone(),
        }
        .into());
    }

    Ok(VotingResult {
        content: first.content.clone(),
        agreement: 1.0,
        explanation: format!("all {} votes agreed", sorted.len()),
    })
}

/// Confidence is the vote weight. Agreement is the winning share of the total
/// weight, or zero when no input carries positive weight.
pub fn weighted_vote(inputs: &[VotingInput]) -> Result<VotingResult> {
    let sorted = sorted_by_source(inputs)?;
    let weight = |input: &VotingInput| input.confidence.max(0.0);
    let groups = tally(&sorted, weight);
    let (content, winning, count) = heaviest(&groups);
    let total: f64 = sorted.iter().map(|&i| weight(i)).sum();
    let agreement = if total > 0.0 { winning / total } else { 0.0 };

    Ok(VotingResult {
        content: content.to_string(),
        agreement,
        explanation: format!(
            "weight {winning:.3} of {total:.3} from {count} of {} votes",
            sorted.len()
        ),
    })
}

/// The single most confident input wins; agreement is its confidence.
pub fn confidence_vote(inputs: &[VotingInput]) -> Result<VotingResult> {
    let sorted = sorted_by_source(inputs)?;
    let mut best = sorted[0];
    for &input in &sorted[1..] {
        if input.confidence > best.confidence {
            best = input;
        }
    }

    Ok(VotingResult {
        content: best.content.clone(),
        agreement: best.confidence.clamp(0.0, 1.0),
        explanation: format!(
            "'{}' was most confident at {:.3}",
            best.source, best.confidence
        ),
    })
}
