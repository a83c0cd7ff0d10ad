//! Dispatch runtime: agent registration, messaging and invocation.
//!
//! The [`Runtime`] trait is the seam patterns program against. [`LocalRuntime`]
//! is the single-process implementation: agents are invoked directly on the
//! caller's task, fan-out spawns one task per target, and concurrency is
//! bounded by semaphores. A distributed transport would implement the same
//! trait.

pub mod local;
pub mod mailbox;
pub mod result;

use std::sync::Arc;

use async_trait::async_trait;
use troupe_core::{Agent, CallContext, Message, Result};

pub use local::LocalRuntime;
pub use mailbox::Mailbox;
pub use result::{ExecutionResult, ParallelResults};

/// The dispatch contract exposed to patterns.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Register an agent under its name. Fails if the name is taken.
    async fn register(&self, agent: Arc<dyn Agent>) -> Result<()>;

    /// Remove an agent and close its inbound channel.
    async fn unregister(&self, name: &str) -> Result<()>;

    /// Look up a registered agent.
    async fn get(&self, name: &str) -> Option<Arc<dyn Agent>>;

    /// Names of all registered agents, sorted.
    async fn list(&self) -> Vec<String>;

    /// Fire-and-forget delivery into the target's inbound channel.
    async fn send(&self, target: &str, msg: Message) -> Result<()>;

    /// The receive side of an agent's inbound channel.
    async fn recv(&self, source: &str) -> Result<Mailbox>;

    /// Synchronous request/response against one agent.
    async fn call(&self, ctx: &CallContext, target: &str, input: Message) -> Result<Message>;

    /// Call every target concurrently and collect per-target outcomes.
    async fn call_parallel(
        &self,
        ctx: &CallContext,
        targets: &[String],
        input: Message,
    ) -> ParallelResults;

    /// `send` to every registered agent. Returns the first error, after
    /// attempting every target.
    async fn broadcast(&self, msg: Message) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self, ctx: &CallContext) -> Result<()>;
}
