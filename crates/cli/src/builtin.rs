//! Built-in agent factories, so the binary is usable without external agents.
//!
//! | factory  | reply                                              |
//! |----------|----------------------------------------------------|
//! | `echo`   | the input payload                                  |
//! | `static` | `reply` (or `prompt`) from the definition          |
//! | `upper`  | the input payload upper-cased                      |
//! | `score`  | the input payload, with a `score` metadata entry   |
//!
//! Any definition may set `confidence`, which is attached to every reply for
//! weighted and confidence voting.

use std::sync::Arc;

use async_trait::async_trait;
use troupe_core::{Agent, AgentDef, CallContext, Error, FactoryRegistry, Message, Result};

pub const FACTORIES: [&str; 4] = ["echo", "static", "upper", "score"];

#[derive(Debug, Clone, PartialEq)]
enum Behavior {
    Echo,
    Static(String),
    Upper,
    Score { score: f64, feedback: Option<String> },
}

struct BuiltinAgent {
    name: String,
    role: String,
    behavior: Behavior,
    confidence: Option<f64>,
}

impl BuiltinAgent {
    fn from_def(def: &AgentDef, behavior: Behavior) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: def.name.clone(),
            role: if def.role.is_empty() {
                def.factory_name().to_string()
            } else {
                def.role.clone()
            },
            behavior,
            confidence: def.extra_f64("confidence"),
        })
    }
}

#[async_trait]
impl Agent for BuiltinAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    async fn execute(&self, ctx: &CallContext, input: Message) -> Result<Message> {
        ctx.check()?;
        let mut reply = match &self.behavior {
            Behavior::Echo => Message::response(input.payload),
            Behavior::Static(text) => Message::response(text.as_str()),
            Behavior::Upper => Message::response(input.payload.to_uppercase()),
            Behavior::Score { score, feedback } => {
                let reply = Message::response(input.payload).with_metadata("score", *score);
                match feedback {
                    Some(feedback) => reply.with_metadata("feedback", feedback.as_str()),
                    None => reply,
                }
            }
        };
        if let Some(confidence) = self.confidence {
            reply = reply.with_metadata("confidence", confidence);
        }
        Ok(reply)
    }
}

/// Register every built-in factory on `registry`.
pub fn register(registry: &FactoryRegistry) {
    registry.register("echo", |def: &AgentDef| {
        Ok(BuiltinAgent::from_def(def, Behavior::Echo))
    });
    registry.register("upper", |def: &AgentDef| {
        Ok(BuiltinAgent::from_def(def, Behavior::Upper))
    });
    registry.register("static", |def: &AgentDef| {
        let text = def
            .extra_str("reply")
            .map(str::to_string)
            .or_else(|| def.prompt.clone())
            .ok_or_else(|| {
                Error::config(format!("static agent '{}' needs `reply` or `prompt`", def.name))
            })?;
        Ok(BuiltinAgent::from_def(def, Behavior::Static(text)))
    });
    registry.register("score", |def: &AgentDef| {
        let score = def.extra_f64("score").unwrap_or(1.0);
        if !(0.0..=1.0).contains(&score) {
            return Err(Error::config(format!(
                "score agent '{}': score must be between 0.0 and 1.0",
                def.name
            )));
        }
        let feedback = def.prompt.clone();
        Ok(BuiltinAgent::from_def(def, Behavior::Score { score, feedback }))
    });
}
