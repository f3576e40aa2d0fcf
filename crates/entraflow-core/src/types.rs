use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EntraflowError;
use crate::payload::Payload;
use crate::workflow::WorkflowDefinition;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run-time status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    PartiallyCompleted,
    Failed,
    /// Failed because cancellation was requested, not because of an error.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::PartiallyCompleted => "partially_completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "failed (cancelled)",
        };
        f.write_str(s)
    }
}

/// What went wrong with a node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    Validation,
    Execution,
    Timeout,
}

/// Serializable record of the last failure of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&EntraflowError> for NodeError {
    fn from(err: &EntraflowError) -> Self {
        let kind = match err {
            EntraflowError::Validation(_) => NodeErrorKind::Validation,
            EntraflowError::Timeout { .. } => NodeErrorKind::Timeout,
            _ => NodeErrorKind::Execution,
        };
        Self::new(kind, err.to_string())
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Per-node state inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub status: NodeStatus,
    /// Attempts started so far.
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<NodeError>,
    #[serde(default)]
    pub result: Option<Payload>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a retrying node may be dispatched again.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            attempts: 0,
            last_error: None,
            result: None,
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    /// The definition this run executes. Shared, never mutated.
    pub definition: Arc<WorkflowDefinition>,
    pub nodes: HashMap<String, NodeState>,
    pub status: RunStatus,
    /// Run-scoped inputs handed to every agent.
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once any save failed; resumption may lose later transitions.
    #[serde(default)]
    pub durability_degraded: bool,
}

impl WorkflowRun {
    /// Create a fresh run with every node `Pending`.
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        let nodes = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::pending(&n.id)))
            .collect();
        Self {
            run_id: RunId::new(),
            definition,
            nodes,
            status: RunStatus::InProgress,
            inputs,
            created_at: now,
            updated_at: now,
            completed_at: None,
            durability_degraded: false,
        }
    }

    pub fn workflow_name(&self) -> &str {
        &self.definition.name
    }

    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    /// Node states in declaration order.
    pub fn ordered_nodes(&self) -> Vec<&NodeState> {
        self.definition
            .nodes
            .iter()
            .filter_map(|spec| self.nodes.get(&spec.id))
            .collect()
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            workflow: self.definition.name.clone(),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            total: self.nodes.len(),
            succeeded: self.count(NodeStatus::Succeeded),
            failed: self.count(NodeStatus::Failed),
            skipped: self.count(NodeStatus::Skipped),
            durability_degraded: self.durability_degraded,
        }
    }
}

/// Compact view of a run, for listings and status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub durability_degraded: bool,
}

/// Everything an agent sees when it is invoked for a node.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub run_id: RunId,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The node's `config` table from the workflow definition.
    pub config: serde_json::Value,
    /// Payloads of succeeded upstream nodes, keyed by node id.
    pub upstream: HashMap<String, Payload>,
    /// Run-scoped inputs.
    pub inputs: HashMap<String, serde_json::Value>,
}

impl AgentContext {
    /// Get an upstream payload by node id.
    pub fn upstream(&self, node_id: &str) -> Option<&Payload> {
        self.upstream.get(node_id)
    }

    /// Get a run input by key.
    pub fn input(&self, key: &str) -> Option<&serde_json::Value> {
        self.inputs.get(key)
    }
}

/// A single agent invocation outside any workflow, as read from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRequest {
    /// Node id reported to the agent. Defaults to the agent name.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub upstream: HashMap<String, Payload>,
}

impl AgentRequest {
    /// First-attempt context under a fresh run id.
    pub fn into_context(self, agent: &str) -> AgentContext {
        AgentContext {
            run_id: RunId::new(),
            node_id: self.node_id.unwrap_or_else(|| agent.to_string()),
            attempt: 1,
            config: self.config,
            upstream: self.upstream,
            inputs: self.inputs,
        }
    }
}

/// Health snapshot reported by an agent for status surfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub name: String,
    pub executions: u64,
    pub failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl AgentHealth {
    pub fn healthy(&self) -> bool {
        self.executions == 0 || self.failures < self.executions
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        workflow: String,
        resumed: bool,
    },
    NodeStatusChanged {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
        attempt: u32,
    },
    RetryScheduled {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    PersistenceDegraded {
        run_id: RunId,
        error: String,
    },
    CancellationRequested {
        run_id: RunId,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::NodeStatusChanged { run_id, .. }
            | RunEvent::RetryScheduled { run_id, .. }
            | RunEvent::PersistenceDegraded { run_id, .. }
            | RunEvent::CancellationRequested { run_id }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}
