use futures::future::BoxFuture;

use crate::error::Result;
use crate::payload::Payload;
use crate::types::{AgentContext, AgentHealth, RunId, RunSummary, WorkflowRun};

/// One pluggable processing unit behind a workflow node.
///
/// Agents never schedule, retry or time themselves out; the engine does.
pub trait Agent: Send + Sync + 'static {
    /// Agent name (matched against `NodeSpec::agent`).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Reject a context before execution. A rejection counts as a failed
    /// attempt and is subject to the node's retry policy.
    fn validate_input(&self, ctx: &AgentContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Run the agent and return its payload.
    fn execute(&self, ctx: AgentContext) -> BoxFuture<'_, Result<Payload>>;

    /// Health snapshot for status surfaces. Not consulted by the scheduler.
    fn status(&self) -> AgentHealth {
        AgentHealth {
            name: self.name().to_string(),
            ..Default::default()
        }
    }
}

/// Persistence backend for workflow runs.
pub trait StateStore: Send + Sync + 'static {
    /// Insert or replace the snapshot of a run.
    fn save(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>>;

    /// Load a run. Fails with `RunNotFound` when the id is unknown.
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<WorkflowRun>>;

    /// Summaries of all stored runs, newest first.
    fn list_runs(&self) -> BoxFuture<'_, Result<Vec<RunSummary>>>;
}
