//! Call context: cancellation and deadlines for agent invocations.
//!
//! Every invocation accepts a [`CallContext`]. It carries only a cancellation
//! token and an optional deadline; business dependencies (the runtime, agent
//! names, configuration) are always passed explicitly.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, RuntimeError};

/// Cancellation and deadline scope for a call tree.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child context whose deadline is at most `timeout` from now.
    ///
    /// Cancelling the parent cancels the child, not the other way round.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// A child context sharing this context's deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.is_expired()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The error a caller should surface if this context is already done.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(RuntimeError::Cancelled.into());
        }
        if self.is_expired() {
            return Err(RuntimeError::Timeout("context deadline exceeded".into()).into());
        }
        Ok(())
    }

    /// Resolves when the context is cancelled or its deadline passes, yielding
    /// the matching error.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => RuntimeError::Cancelled.into(),
                    _ = tokio::time::sleep_until(deadline) => {
                        RuntimeError::Timeout("context deadline exceeded".into()).into()
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                RuntimeError::Cancelled.into()
            }
        }
    }

    /// Race `fut` against cancellation and the deadline.
    ///
    /// The future is dropped if the context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => out,
        }
    }
}
