//! Agent trait: the capability contract every unit of work implements.
//!
//! The dispatch runtime never inspects concrete agent types. It only relies on
//! the capabilities below: identify, start, execute, stop and readiness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::context::CallContext;
use crate::error::Result;
use crate::message::Message;
use crate::value::Value;

/// The core Agent trait.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique, addressable name of this agent.
    fn name(&self) -> &str;

    /// Free-form role label (e.g. "critic", "retriever").
    fn role(&self) -> &str;

    /// Long-running startup hook. Called once when the runtime starts; the
    /// context is cancelled when the runtime stops.
    async fn start(&self, _ctx: CallContext) -> Result<()> {
        Ok(())
    }

    /// Handle one request and produce one response.
    ///
    /// Observing `ctx` cancellation during a long call is the agent's job;
    /// the runtime never interrupts a running call.
    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message>;

    /// Shutdown hook.
    async fn stop(&self, _ctx: &CallContext) -> Result<()> {
        Ok(())
    }

    /// Whether the agent can accept calls right now.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Declarative agent descriptor, read once when an agent is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDef {
    /// Unique agent name
    pub name: String,

    /// Role label
    #[serde(default)]
    pub role: String,

    /// Factory used to build the agent. Falls back to `role` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<String>,

    /// Model hint passed to the factory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Timing interval in milliseconds for agents that act periodically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    /// Input bindings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,

    /// Output bindings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,

    /// Prompt or instruction text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Tool names the agent may use
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,

    /// Any other keys, passed through to the factory
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AgentDef {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            factory: None,
            model: None,
            interval_ms: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            prompt: None,
            tools: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_factory(mut self, factory: impl Into<String>) -> Self {
        self.factory = Some(factory.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The factory name this definition resolves to.
    pub fn factory_name(&self) -> &str {
        self.factory.as_deref().unwrap_or(&self.role)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(Value::as_f64)
    }
}
