//! Error types for the troupe domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all troupe operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Dispatch runtime errors ---
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    // --- Voting errors ---
    #[error("Vote error: {0}")]
    Vote(#[from] VoteError),

    // --- Pattern errors ---
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    // --- Failures reported by agent implementations ---
    #[error("Agent '{agent}' failed: {reason}")]
    Agent { agent: String, reason: String },

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an agent-reported failure.
    pub fn agent(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Agent {
            agent: agent.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    /// Whether this error came from cancellation or an expired deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Runtime(RuntimeError::Cancelled) | Error::Runtime(RuntimeError::Timeout(_))
        )
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Agent already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Runtime already started")]
    AlreadyStarted,

    #[error("Runtime not started")]
    NotStarted,

    #[error("Agent not ready: {0}")]
    NotReady(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel closed for agent: {0}")]
    ChannelClosed(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoteError {
    #[error("No inputs to vote on")]
    NoInputs,

    #[error("Disagreement between '{first}' and '{second}'")]
    Disagreement { first: String, second: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatternError {
    #[error("Insufficient agreement: observed {observed:.3}, required {required:.3}")]
    InsufficientAgreement { observed: f64, required: f64 },

    #[error("All {count} agents failed: {summary}")]
    AllAgentsFailed { count: usize, summary: String },

    #[error("Maximum handoffs exceeded ({max})")]
    MaxHandoffsExceeded { max: usize },

    #[error("Invalid handoff target '{target}' requested by '{from}'")]
    InvalidHandoffTarget { from: String, target: String },

    #[error("Dependencies not met for step '{step}': missing {missing:?}")]
    DependenciesNotMet { step: String, missing: Vec<String> },

    #[error("Plan has {steps} steps, exceeding the maximum of {max}")]
    PlanExceedsMaxSteps { steps: usize, max: usize },

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Step {index} ('{agent}') failed after {completed} completed steps: {reason}")]
    StepFailed {
        index: usize,
        agent: String,
        completed: usize,
        reason: String,
    },

    #[error("Hierarchy depth {depth} exceeds the maximum of {max}")]
    MaxDepthExceeded { depth: usize, max: usize },

    #[error("Invalid pattern configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_displays_correctly() {
        let err = Error::Runtime(RuntimeError::NotFound("summarizer".into()));
        assert!(err.to_string().contains("summarizer"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn agreement_error_shows_both_values() {
        let err = Error::Pattern(PatternError::InsufficientAgreement {
            observed: 0.4,
            required: 0.75,
        });
        let text = err.to_string();
        assert!(text.contains("0.400"));
        assert!(text.contains("0.750"));
    }

    #[test]
    fn disagreement_names_both_sources() {
        let err = Error::from(VoteError::Disagreement {
            first: "alpha".into(),
            second: "beta".into(),
        });
        assert!(err.to_string().contains("alpha"));
        assert!(err.to_string().contains("beta"));
    }

    #[test]
    fn cancellation_detection() {
        assert!(Error::Runtime(RuntimeError::Cancelled).is_cancellation());
        assert!(Error::Runtime(RuntimeError::Timeout("call".into())).is_cancellation());
        assert!(!Error::agent("a", "boom").is_cancellation());
    }
}
