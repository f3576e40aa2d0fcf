use std::collections::HashMap;
use std::sync::Arc;

use entraflow_core::error::{EntraflowError, Result};
use entraflow_core::traits::Agent;
use entraflow_core::types::AgentHealth;

/// Registry of available agents, keyed by name.
///
/// Passed explicitly to the graph builder and the orchestrator.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent. A later registration with the same name wins.
    pub fn register(&mut self, agent: impl Agent) {
        let name = agent.name().to_string();
        self.agents.insert(name, Arc::new(agent));
    }

    /// Register an already shared agent.
    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        self.agents.insert(name, agent);
    }

    /// Unregister an agent by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.agents.remove(name).is_some()
    }

    /// Get an agent by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    /// Get an agent by name, or `AgentNotFound`.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.get(name)
            .ok_or_else(|| EntraflowError::AgentNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// List all registered agent names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Health snapshots of every agent, sorted by name.
    pub fn statuses(&self) -> Vec<AgentHealth> {
        let mut statuses: Vec<AgentHealth> = self.agents.values().map(|a| a.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Create a registry with all built-in agents registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::PassthroughAgent::default());
        registry.register(crate::builtin::ConstantAgent::default());
        registry.register(crate::builtin::CommandAgent::default());
        registry
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
