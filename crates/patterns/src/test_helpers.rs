//! Shared test helpers for pattern tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use troupe_core::{Agent, CallContext, Error, Message, Result};
use troupe_runtime::{LocalRuntime, Runtime};

/// Register `agents` on a fresh runtime and start it.
pub async fn started_runtime(agents: Vec<Arc<dyn Agent>>) -> Arc<dyn Runtime> {
    let runtime = LocalRuntime::default();
    runtime.register_all(agents).await.unwrap();
    runtime.start().await.unwrap();
    Arc::new(runtime)
}

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Replies `"{name}:{payload}"`.
pub struct EchoAgent {
    name: String,
}

impl EchoAgent {
    pub fn shared(name: &str) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        "echo"
    }

    async fn execute(&self, _ctx: &CallContext, input: Message) -> Result<Message> {
        Ok(Message::response(format!("{}:{}", self.name, input.payload)))
    }
}

/// Returns scripted responses in order and records every input it sees.
///
/// Panics if called more times than responses were provided.
pub struct ScriptedAgent {
    name: String,
    responses: Mutex<VecDeque<Result<Message>>>,
    inputs: Mutex<Vec<Message>>,
}

impl ScriptedAgent {
    pub fn new(name: &str, responses: Vec<Result<Message>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            responses: Mutex::new(responses.into()),
            inputs: Mutex::new(Vec::new()),
        })
    }

    /// Script plain-text responses.
    pub fn texts(name: &str, texts: &[&str]) -> Arc<Self> {
        Self::new(
            name,
            texts.iter().map(|t| Ok(Message::response(*t))).collect(),
        )
    }

    /// This agent as a registrable trait object.
    pub fn agent(self: &Arc<Self>) -> Arc<dyn Agent> {
        Arc::clone(self) as Arc<dyn Agent>
    }

    pub fn inputs(&self) -> Vec<Message> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, _ctx: &CallContext, input: Message) -> Result<Message> {
        self.inputs.lock().unwrap().push(input);
        let mut responses = self.responses.lock().unwrap();
        match responses.pop_front() {
            Some(response) => response,
            None => panic!("ScriptedAgent '{}': no more responses", self.name),
        }
    }
}

/// Always fails.
pub struct FailingAgent {
    name: String,
}

impl FailingAgent {
    pub fn shared(name: &str) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _ctx: &CallContext, _input: Message) -> Result<Message> {
        Err(Error::agent(&self.name, "scripted failure"))
    }
}

/// Sleeps, then echoes like [`EchoAgent`].
pub struct SlowAgent {
    name: String,
    delay: Duration,
}

impl SlowAgent {
    pub fn shared(name: &str, delay: Duration) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
        })
    }
}

#[async_trait]
impl Agent for SlowAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _ctx: &CallContext, input: Message) -> Result<Message> {
        tokio::time::sleep(self.delay).await;
        Ok(Message::response(format!("{}:{}", self.name, input.payload)))
    }
}

type Handler = Box<dyn Fn(&Message) -> Result<Message> + Send + Sync>;

/// Delegates to a closure.
pub struct FnAgent {
    name: String,
    handler: Handler,
}

impl FnAgent {
    pub fn shared<F>(name: &str, handler: F) -> Arc<dyn Agent>
    where
        F: Fn(&Message) -> Result<Message> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            handler: Box::new(handler),
        })
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        "fn"
    }

    async fn execute(&self, _ctx: &CallContext, input: Message) -> Result<Message> {
        (self.handler)(&input)
    }
}
