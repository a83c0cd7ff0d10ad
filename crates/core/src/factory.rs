//! Agent factories: build live agents from declarative definitions.
//!
//! A [`FactoryRegistry`] is an explicit value handed to whatever constructs
//! agents. [`FactoryRegistry::global`] exists for binaries that want a
//! process-wide default; library code never consults it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use crate::agent::{Agent, AgentDef};
use crate::error::{Error, Result};

/// Constructor turning an [`AgentDef`] into a live agent.
pub type AgentFactory = Arc<dyn Fn(&AgentDef) -> Result<Arc<dyn Agent>> + Send + Sync>;

/// Name → constructor mapping. Registration is last-write-wins.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: RwLock<HashMap<String, AgentFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry.
    pub fn global() -> &'static FactoryRegistry {
        static GLOBAL: OnceLock<FactoryRegistry> = OnceLock::new();
        GLOBAL.get_or_init(FactoryRegistry::new)
    }

    /// Register a factory. Replaces any existing factory with the same name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AgentDef) -> Result<Arc<dyn Agent>> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if factories.insert(name.clone(), Arc::new(factory)).is_some() {
            debug!(factory = %name, "Replaced agent factory");
        } else {
            debug!(factory = %name, "Registered agent factory");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    /// List all registered factory names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Build an agent from its definition using the factory it names.
    pub fn create(&self, def: &AgentDef) -> Result<Arc<dyn Agent>> {
        let factory_name = def.factory_name();
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(factory_name)
            .cloned()
            .ok_or_else(|| {
                Error::config(format!(
                    "No agent factory '{}' for agent '{}'",
                    factory_name, def.name
                ))
            })?;

        // The lock is released before running user code.
        factory(def)
    }
}
