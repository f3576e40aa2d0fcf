use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::{EntraflowError, Result};

/// A declarative workflow: agent invocations plus the dependencies between them.
///
/// Immutable once loaded. Runs share it through an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Nodes in declaration order. Declaration order breaks scheduling ties.
    pub nodes: Vec<NodeSpec>,
    /// Explicit edges, optionally conditional.
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// One agent invocation inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Name of the registered agent that executes this node.
    pub agent: String,
    /// Agent-specific configuration, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    /// Unconditional dependencies, shorthand for `[[edges]]` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Per-attempt timeout. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Maximum number of attempts, the first one included. Falls back to the
    /// engine default. Zero is treated as one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Delay policy between attempts. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
    /// An optional node may fail without failing the run.
    #[serde(default)]
    pub optional: bool,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            config: serde_json::Value::Null,
            depends_on: vec![],
            timeout_ms: None,
            max_retries: None,
            backoff: None,
            optional: false,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A dependency edge. The target runs only after the source succeeded and,
/// when present, the condition holds against the source's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl EdgeSpec {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create a conditional edge.
    pub fn when(from: impl Into<String>, to: impl Into<String>, condition: Condition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        }
    }
}

/// Exponential backoff between attempts of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied for each further attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Spread delays by 0.8x to 1.2x.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

fn default_base_delay_ms() -> u64 { 1000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30_000 }

/// Top-level wrapper for a standalone workflow file (`[workflow]` table).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowFile {
    pub workflow: WorkflowDefinition,
}

impl WorkflowFile {
    /// Parse a workflow definition from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| EntraflowError::InvalidDefinition(format!("TOML parse error: {}", e)))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EntraflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    /// Get a node by id.
    pub fn get_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All edges: `depends_on` shorthands in node order, then explicit edges.
    pub fn all_edges(&self) -> Vec<EdgeSpec> {
        let mut edges: Vec<EdgeSpec> = self
            .nodes
            .iter()
            .flat_map(|n| n.depends_on.iter().map(|dep| EdgeSpec::always(dep, &n.id)))
            .collect();
        edges.extend(self.edges.iter().cloned());
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::CompareOp;

    const BRIEFING: &str = r#"
[workflow]
name = "daily_briefing"
description = "Fetch, analyze, decide, notify"

[[workflow.nodes]]
id = "fetch"
agent = "data_fetcher"
timeout_ms = 10000
max_retries = 3
config = { sources = ["weather", "news"] }

[workflow.nodes.backoff]
base_delay_ms = 500
multiplier = 3.0

[[workflow.nodes]]
id = "analyze"
agent = "analyzer"
depends_on = ["fetch"]

[[workflow.nodes]]
id = "alert"
agent = "notifier"
optional = true

[[workflow.edges]]
from = "analyze"
to = "alert"
condition = "sentiment.score < -0.5"
"#;

    #[test]
    fn test_parse_workflow_file() {
        let wf = WorkflowFile::from_toml(BRIEFING).unwrap().workflow;
        assert_eq!(wf.name, "daily_briefing");
        assert_eq!(wf.nodes.len(), 3);

        let fetch = wf.get_node("fetch").unwrap();
        assert_eq!(fetch.timeout_ms, Some(10_000));
        assert_eq!(fetch.max_retries, Some(3));
        assert_eq!(fetch.config["sources"][1], "news");
        let backoff = fetch.backoff.as_ref().unwrap();
        assert_eq!(backoff.base_delay_ms, 500);
        assert_eq!(backoff.multiplier, 3.0);
        assert_eq!(backoff.max_delay_ms, 30_000);

        assert!(wf.get_node("alert").unwrap().optional);
        assert!(!wf.get_node("analyze").unwrap().optional);

        let cond = wf.edges[0].condition.as_ref().unwrap();
        assert_eq!(cond.op, CompareOp::LessThan);
        assert_eq!(cond.field, "sentiment.score");
    }

    #[test]
    fn test_all_edges_merges_depends_on() {
        let wf = WorkflowFile::from_toml(BRIEFING).unwrap().workflow;
        let edges = wf.all_edges();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0], EdgeSpec::always("fetch", "analyze"));
        assert_eq!(edges[1].from, "analyze");
        assert!(edges[1].condition.is_some());
    }

    #[test]
    fn test_bad_condition_rejected_at_parse() {
        let toml = r#"
[workflow]
name = "bad"
[[workflow.nodes]]
id = "a"
agent = "x"
[[workflow.nodes]]
id = "b"
agent = "x"
[[workflow.edges]]
from = "a"
to = "b"
condition = "whenever it feels right"
"#;
        assert!(WorkflowFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_builder() {
        let wf = WorkflowDefinition::new("wf")
            .with_description("desc")
            .node(NodeSpec::new("a", "passthrough").with_max_retries(2))
            .node(NodeSpec::new("b", "passthrough").depends_on(&["a"]).optional())
            .edge(EdgeSpec::always("a", "b"));
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.nodes[0].max_retries, Some(2));
        assert!(wf.nodes[1].optional);
        assert_eq!(wf.all_edges().len(), 2);
    }

    #[test]
    fn test_json_roundtrip_keeps_conditions() {
        let wf = WorkflowFile::from_toml(BRIEFING).unwrap().workflow;
        let json = serde_json::to_string(&wf).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(wf, back);
    }
}
