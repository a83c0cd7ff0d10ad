//! Result shapes produced by runtime invocations.

use std::collections::BTreeMap;
use std::time::Duration;

use troupe_core::{Error, Message, Metadata};

/// Outcome of one agent invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Which agent produced this.
    pub agent: String,
    /// The response payload (empty on failure).
    pub output: String,
    /// Response metadata (empty on failure).
    pub metadata: Metadata,
    /// Failure description, if the call failed.
    pub error: Option<String>,
    /// Wall-clock time spent, including any wait for a concurrency slot.
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(agent: impl Into<String>, message: Message, duration: Duration) -> Self {
        Self {
            agent: agent.into(),
            output: message.payload,
            metadata: message.metadata,
            error: None,
            duration,
        }
    }

    pub fn failure(agent: impl Into<String>, error: &Error, duration: Duration) -> Self {
        Self {
            agent: agent.into(),
            output: String::new(),
            metadata: Metadata::new(),
            error: Some(error.to_string()),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Rebuild a response message carrying this result's payload and metadata.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::response(self.output.clone());
        msg.metadata = self.metadata.clone();
        msg
    }
}

/// Collected outcome of a fan-out call.
///
/// Successes and errors are keyed by target name. Partial success is the
/// normal outcome; the batch as a whole never fails.
#[derive(Debug, Default)]
pub struct ParallelResults {
    pub successes: BTreeMap<String, ExecutionResult>,
    pub errors: BTreeMap<String, Error>,
    /// Target names in the order their calls finished.
    pub completion_order: Vec<String>,
    /// Time each target took, failures included.
    pub durations: BTreeMap<String, Duration>,
}

impl ParallelResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one target's outcome.
    pub fn record(&mut self, target: String, outcome: Result<Message, Error>, elapsed: Duration) {
        self.completion_order.push(target.clone());
        self.durations.insert(target.clone(), elapsed);
        match outcome {
            Ok(message) => {
                let result = ExecutionResult::success(target.clone(), message, elapsed);
                self.successes.insert(target, result);
            }
            Err(err) => {
                self.errors.insert(target, err);
            }
        }
    }

    pub fn contains(&self, target: &str) -> bool {
        self.successes.contains_key(target) || self.errors.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.successes.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_failed(&self) -> bool {
        self.successes.is_empty()
    }

    /// Successful results in completion order.
    pub fn successes_in_completion_order(&self) -> Vec<&ExecutionResult> {
        self.completion_order
            .iter()
            .filter_map(|name| self.successes.get(name))
            .collect()
    }

    /// Remove and return the error of the lexicographically first failed target.
    pub fn take_first_error(&mut self) -> Option<(String, Error)> {
        let name = self.errors.keys().next()?.clone();
        self.errors.remove(&name).map(|err| (name, err))
    }

    /// One-line description of every failure, sorted by target name.
    pub fn failure_summary(&self) -> String {
        self.errors
            .iter()
            .map(|(name, err)| format!("{name}: {err}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::RuntimeError;

    #[test]
    fn record_splits_successes_and_errors() {
        let mut results = ParallelResults::new();
        results.record(
            "b".into(),
            Ok(Message::response("fine").with_metadata("confidence", 0.7)),
            Duration::from_millis(5),
        );
        results.record(
            "a".into(),
            Err(RuntimeError::NotFound("a".into()).into()),
            Duration::from_millis(1),
        );

        assert_eq!(results.len(), 2);
        assert!(!results.all_failed());
        assert_eq!(results.successes["b"].output, "fine");
        assert_eq!(results.successes["b"].metadata.get_f64("confidence"), Some(0.7));
        assert_eq!(results.completion_order, vec!["b", "a"]);
        assert_eq!(results.durations["a"], Duration::from_millis(1));
        assert!(results.failure_summary().starts_with("a: "));
    }

    #[test]
    fn take_first_error_is_sorted_by_name() {
        let mut results = ParallelResults::new();
        results.record("zed".into(), Err(Error::agent("zed", "x")), Duration::ZERO);
        results.record("amy".into(), Err(Error::agent("amy", "y")), Duration::ZERO);
        let (name, _) = results.take_first_error().unwrap();
        assert_eq!(name, "amy");
        assert_eq!(results.errors.len(), 1);
    }

    #[test]
    fn failure_result_keeps_error_text() {
        let err = Error::agent("w", "exploded");
        let result = ExecutionResult::failure("w", &err, Duration::from_millis(3));
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("exploded"));
    }
}
