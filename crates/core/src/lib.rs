//! # troupe core
//!
//! Domain types, traits, and error definitions for the troupe multi-agent
//! orchestration engine. Everything else (the dispatch runtime, the pattern
//! library, the CLI) depends inward on this crate.
//!
//! ## Contents
//!
//! - [`Agent`]: the capability contract any unit of work implements
//! - [`Message`] with typed [`Metadata`]
//! - [`CallContext`]: cancellation and deadline scope for invocations
//! - [`AgentDef`] and [`FactoryRegistry`]: declarative agent construction
//! - [`Error`]: the error taxonomy shared by every crate

pub mod agent;
pub mod context;
pub mod error;
pub mod factory;
pub mod message;
pub mod value;

// Re-export key types at crate root for ergonomics
pub use agent::{Agent, AgentDef};
pub use context::CallContext;
pub use error::{Error, PatternError, Result, RuntimeError, VoteError};
pub use factory::{AgentFactory, FactoryRegistry};
pub use message::Message;
pub use value::{Metadata, Value};
