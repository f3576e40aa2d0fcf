use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use entraflow_core::config::EngineConfig;
use entraflow_core::error::{EntraflowError, Result};
use entraflow_core::event::EventBus;
use entraflow_core::payload::Payload;
use entraflow_core::traits::{Agent, StateStore};
use entraflow_core::types::{
    AgentContext, NodeError, NodeState, NodeStatus, RunEvent, RunId, RunStatus, RunSummary,
    WorkflowRun,
};
use entraflow_core::workflow::{BackoffPolicy, NodeSpec, WorkflowDefinition};

use super::builder::ExecutionGraph;
use super::readiness::{self, Readiness};
use crate::backoff;
use crate::registry::AgentRegistry;

/// Executes workflow runs.
///
/// The orchestrator validates a definition into an [`ExecutionGraph`],
/// dispatches ready nodes to their agents (at most `max_parallelism` at a
/// time), retries failed attempts with backoff, and persists the run after
/// every node-status transition so it can be resumed later.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            event_bus: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Publish run events on this bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops dispatching new nodes when cancelled. In-flight nodes
    /// are allowed to settle and the run ends as `Cancelled`. Once cancelled,
    /// every later run on this orchestrator ends `Cancelled` without
    /// dispatching anything.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a definition and return its execution graph.
    pub fn plan(&self, definition: Arc<WorkflowDefinition>) -> Result<ExecutionGraph> {
        ExecutionGraph::build(definition, &self.registry)
    }

    /// Run a workflow from scratch, or resume a stored run of it.
    pub async fn run(
        &self,
        definition: Arc<WorkflowDefinition>,
        resume_from: Option<&RunId>,
    ) -> Result<WorkflowRun> {
        let Some(run_id) = resume_from else {
            return self.start(definition, HashMap::new()).await;
        };

        let stored = self.store.load(run_id).await?;
        if stored.definition.name != definition.name {
            return Err(EntraflowError::InvalidDefinition(format!(
                "Run {} belongs to workflow '{}', not '{}'",
                run_id, stored.definition.name, definition.name
            )));
        }
        self.resume_run(stored).await
    }

    /// Start a new run with run-scoped inputs.
    pub async fn start(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowRun> {
        let graph = self.plan(definition.clone())?;
        let run = WorkflowRun::new(definition, inputs);
        info!(
            run_id = %run.run_id,
            workflow = %run.workflow_name(),
            nodes = graph.len(),
            "Starting workflow run"
        );
        RunDriver::new(self, graph, run).drive(false).await
    }

    /// Resume a stored run. Succeeded and skipped nodes are never re-executed.
    /// A run with nothing left to do is returned as stored.
    pub async fn resume(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let stored = self.store.load(run_id).await?;
        self.resume_run(stored).await
    }

    /// Run one agent outside any workflow: input validation, then execution
    /// under the default node timeout. Nothing is persisted.
    pub async fn execute_agent(&self, agent: &str, ctx: AgentContext) -> Result<Payload> {
        let resolved = self.registry.require(agent)?;
        let timeout = Duration::from_secs(self.config.default_timeout_secs);
        info!(agent, node_id = %ctx.node_id, "Executing agent standalone");
        run_attempt(Ok(resolved), ctx, timeout).await
    }

    /// Summary of a stored run.
    pub async fn status(&self, run_id: &RunId) -> Result<RunSummary> {
        Ok(self.store.load(run_id).await?.summary())
    }

    /// Summaries of all stored runs, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        self.store.list_runs().await
    }

    async fn resume_run(&self, mut run: WorkflowRun) -> Result<WorkflowRun> {
        if !self.rearm(&mut run) {
            info!(run_id = %run.run_id, status = %run.status, "Nothing to resume");
            return Ok(run);
        }

        let graph = self.plan(run.definition.clone())?;
        info!(
            run_id = %run.run_id,
            workflow = %run.workflow_name(),
            succeeded = run.count(NodeStatus::Succeeded),
            "Resuming workflow run"
        );
        RunDriver::new(self, graph, run).drive(true).await
    }

    /// Prepare node states for resumption. Returns false when the run has
    /// nothing left to execute.
    ///
    /// An interrupted `Running` attempt is not counted against the node.
    fn rearm(&self, run: &mut WorkflowRun) -> bool {
        let mut resumable = !run.status.is_terminal();
        let definition = run.definition.clone();

        for spec in &definition.nodes {
            let max_attempts = self.max_attempts(spec);
            let state = run
                .nodes
                .entry(spec.id.clone())
                .or_insert_with(|| NodeState::pending(&spec.id));
            match state.status {
                NodeStatus::Succeeded | NodeStatus::Skipped => {}
                NodeStatus::Running => {
                    state.status = NodeStatus::Ready;
                    state.attempts = state.attempts.saturating_sub(1);
                    state.next_attempt_at = None;
                    resumable = true;
                }
                NodeStatus::Failed if state.attempts < max_attempts => {
                    state.status = NodeStatus::Ready;
                    state.finished_at = None;
                    state.next_attempt_at = None;
                    resumable = true;
                }
                NodeStatus::Failed => {}
                NodeStatus::Pending | NodeStatus::Ready => resumable = true,
            }
        }
        resumable
    }

    fn max_attempts(&self, spec: &NodeSpec) -> u32 {
        spec.max_retries
            .unwrap_or(self.config.default_max_retries)
            .max(1)
    }

    fn node_timeout(&self, spec: &NodeSpec) -> Duration {
        spec.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.config.default_timeout_secs))
    }

    fn backoff_policy<'a>(&'a self, spec: &'a NodeSpec) -> &'a BackoffPolicy {
        spec.backoff.as_ref().unwrap_or(&self.config.backoff)
    }

    fn emit(&self, event: RunEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

type AttemptOutcome = (usize, Result<Payload>);

enum Wake {
    Settled(std::result::Result<AttemptOutcome, JoinError>),
    RetryDue,
    Cancelled,
}

/// The scheduling loop of one run. Owns the graph and the node states; agent
/// attempts run as tasks and report back through the join set.
struct RunDriver<'a> {
    orchestrator: &'a Orchestrator,
    graph: ExecutionGraph,
    run: WorkflowRun,
    in_flight: JoinSet<AttemptOutcome>,
    retry_at: HashMap<usize, Instant>,
    cancelled: bool,
}

impl<'a> RunDriver<'a> {
    fn new(orchestrator: &'a Orchestrator, graph: ExecutionGraph, run: WorkflowRun) -> Self {
        Self {
            orchestrator,
            graph,
            run,
            in_flight: JoinSet::new(),
            retry_at: HashMap::new(),
            cancelled: false,
        }
    }

    async fn drive(mut self, resumed: bool) -> Result<WorkflowRun> {
        self.run.status = RunStatus::InProgress;
        self.run.completed_at = None;
        self.arm_retry_timers();
        self.orchestrator.emit(RunEvent::RunStarted {
            run_id: self.run.run_id.clone(),
            workflow: self.run.workflow_name().to_string(),
            resumed,
        });
        self.persist().await;

        let max_parallelism = self.orchestrator.config.max_parallelism.max(1);
        let cancel = self.orchestrator.cancel.clone();

        loop {
            if !self.cancelled && cancel.is_cancelled() {
                self.observe_cancel();
            }
            self.promote().await;
            if !self.cancelled {
                self.dispatch_ready(max_parallelism).await;
            }

            let next_retry = if self.cancelled {
                None
            } else {
                self.retry_at.values().min().copied()
            };
            if self.in_flight.is_empty() && next_retry.is_none() {
                break;
            }

            let wake = tokio::select! {
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    Wake::Settled(joined)
                }
                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {
                    Wake::RetryDue
                }
                _ = cancel.cancelled(), if !self.cancelled => Wake::Cancelled,
                else => break,
            };

            match wake {
                Wake::Settled(Ok((node, Ok(payload)))) => self.succeed(node, payload).await,
                Wake::Settled(Ok((node, Err(e)))) => self.fail_attempt(node, e).await,
                Wake::Settled(Err(e)) => {
                    error!(run_id = %self.run.run_id, error = %e, "Node task aborted");
                }
                Wake::RetryDue => {}
                Wake::Cancelled => self.observe_cancel(),
            }
        }

        self.finish().await
    }

    /// Stop dispatching. In-flight nodes still settle.
    fn observe_cancel(&mut self) {
        self.cancelled = true;
        info!(
            run_id = %self.run.run_id,
            in_flight = self.in_flight.len(),
            "Cancellation requested, waiting for in-flight nodes"
        );
        self.orchestrator.emit(RunEvent::CancellationRequested {
            run_id: self.run.run_id.clone(),
        });
    }

    /// Resumed nodes waiting on a backoff keep their remaining delay.
    fn arm_retry_timers(&mut self) {
        let now = Utc::now();
        for node in 0..self.graph.len() {
            let Some(state) = self.run.nodes.get(self.graph.id(node)) else {
                continue;
            };
            if state.status != NodeStatus::Ready {
                continue;
            }
            if let Some(at) = state.next_attempt_at {
                let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
                self.retry_at.insert(node, Instant::now() + remaining);
            }
        }
    }

    /// Move pending nodes to `Ready` or `Skipped`, in topological order so
    /// skips propagate in a single pass.
    async fn promote(&mut self) {
        let order = self.graph.order().to_vec();
        for node in order {
            if self.status(node) != NodeStatus::Pending {
                continue;
            }
            match readiness::evaluate(&self.graph, node, &self.run.nodes) {
                Readiness::Wait => {}
                Readiness::Ready => {
                    self.state_mut(node).status = NodeStatus::Ready;
                    debug!(run_id = %self.run.run_id, node_id = %self.graph.id(node), "Node ready");
                    self.transitioned(node).await;
                }
                Readiness::Skip => {
                    let state = self.state_mut(node);
                    state.status = NodeStatus::Skipped;
                    state.finished_at = Some(Utc::now());
                    info!(run_id = %self.run.run_id, node_id = %self.graph.id(node), "Node skipped");
                    self.transitioned(node).await;
                }
            }
        }
    }

    async fn dispatch_ready(&mut self, max_parallelism: usize) {
        let now = Instant::now();
        let ready: Vec<usize> = self
            .graph
            .order()
            .iter()
            .copied()
            .filter(|&n| self.status(n) == NodeStatus::Ready)
            .filter(|n| self.retry_at.get(n).map_or(true, |at| *at <= now))
            .collect();

        for node in ready {
            if self.in_flight.len() >= max_parallelism {
                break;
            }
            self.dispatch(node).await;
        }
    }

    async fn dispatch(&mut self, node: usize) {
        let spec = self.graph.spec(node).clone();
        let agent = self.orchestrator.registry.require(&spec.agent);
        let timeout = self.orchestrator.node_timeout(&spec);
        let upstream = self.upstream(node);

        self.retry_at.remove(&node);
        let state = self.state_mut(node);
        state.status = NodeStatus::Running;
        state.attempts += 1;
        state.started_at = Some(Utc::now());
        state.finished_at = None;
        state.next_attempt_at = None;
        let attempt = state.attempts;

        let ctx = AgentContext {
            run_id: self.run.run_id.clone(),
            node_id: spec.id.clone(),
            attempt,
            config: spec.config.clone(),
            upstream,
            inputs: self.run.inputs.clone(),
        };

        info!(
            run_id = %self.run.run_id,
            node_id = %spec.id,
            agent = %spec.agent,
            attempt,
            "Dispatching node"
        );
        self.transitioned(node).await;

        let agent_name = spec.agent.clone();
        self.in_flight.spawn(async move {
            let outcome = AssertUnwindSafe(run_attempt(agent, ctx, timeout))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(EntraflowError::Execution {
                        agent: agent_name,
                        message: "agent panicked".into(),
                    })
                });
            (node, outcome)
        });
    }

    async fn succeed(&mut self, node: usize, payload: Payload) {
        let state = self.state_mut(node);
        state.status = NodeStatus::Succeeded;
        state.result = Some(payload);
        state.last_error = None;
        state.finished_at = Some(Utc::now());
        let attempt = state.attempts;
        info!(run_id = %self.run.run_id, node_id = %self.graph.id(node), attempt, "Node succeeded");
        self.transitioned(node).await;
    }

    async fn fail_attempt(&mut self, node: usize, err: EntraflowError) {
        let spec = self.graph.spec(node);
        let max_attempts = self.orchestrator.max_attempts(spec);
        let policy = self.orchestrator.backoff_policy(spec).clone();
        let node_id = spec.id.clone();
        let run_id = self.run.run_id.clone();

        let state = self.state_mut(node);
        state.last_error = Some(NodeError::from(&err));
        let attempt = state.attempts;

        if attempt < max_attempts {
            let delay = backoff::delay_for(&policy, attempt);
            state.status = NodeStatus::Ready;
            state.next_attempt_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            self.retry_at.insert(node, Instant::now() + delay);
            warn!(
                run_id = %run_id,
                node_id = %node_id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Node attempt failed, retrying"
            );
            self.orchestrator.emit(RunEvent::RetryScheduled {
                run_id,
                node_id,
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });
        } else {
            state.status = NodeStatus::Failed;
            state.finished_at = Some(Utc::now());
            error!(
                run_id = %run_id,
                node_id = %node_id,
                attempts = attempt,
                error = %err,
                "Node failed"
            );
        }
        self.transitioned(node).await;
    }

    /// Publish the node's new status and persist the run.
    async fn transitioned(&mut self, node: usize) {
        let (status, attempt) = {
            let state = self.state_mut(node);
            (state.status, state.attempts)
        };
        self.orchestrator.emit(RunEvent::NodeStatusChanged {
            run_id: self.run.run_id.clone(),
            node_id: self.graph.id(node).to_string(),
            status,
            attempt,
        });
        self.persist().await;
    }

    /// Save the run. A failed save is reported and the run carries on.
    async fn persist(&mut self) {
        self.run.updated_at = Utc::now();
        if let Err(e) = self.orchestrator.store.save(&self.run).await {
            warn!(run_id = %self.run.run_id, error = %e, "Failed to persist run state");
            if !self.run.durability_degraded {
                self.run.durability_degraded = true;
                self.orchestrator.emit(RunEvent::PersistenceDegraded {
                    run_id: self.run.run_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn finish(mut self) -> Result<WorkflowRun> {
        let status = self.aggregate();
        self.run.status = status;
        self.run.completed_at = Some(Utc::now());
        self.persist().await;
        self.orchestrator.emit(RunEvent::RunFinished {
            run_id: self.run.run_id.clone(),
            status,
        });

        let summary = self.run.summary();
        if status.is_failure() {
            warn!(
                run_id = %summary.run_id,
                status = %status,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Workflow run finished"
            );
        } else {
            info!(
                run_id = %summary.run_id,
                status = %status,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Workflow run finished"
            );
        }
        Ok(self.run)
    }

    fn aggregate(&self) -> RunStatus {
        let statuses: Vec<NodeStatus> = (0..self.graph.len()).map(|n| self.status(n)).collect();

        if statuses.iter().any(|s| !s.is_terminal()) {
            return if self.cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
        }
        if statuses.iter().all(|s| *s == NodeStatus::Succeeded) {
            return RunStatus::Completed;
        }
        let required_failed = statuses
            .iter()
            .enumerate()
            .any(|(n, s)| *s == NodeStatus::Failed && self.graph.is_required(n));
        if required_failed {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyCompleted
        }
    }

    /// Payloads of succeeded dependencies, keyed by node id.
    fn upstream(&self, node: usize) -> HashMap<String, Payload> {
        self.graph
            .dependencies(node)
            .iter()
            .filter_map(|dep| {
                let id = self.graph.id(dep.from);
                let state = self.run.nodes.get(id)?;
                if state.status != NodeStatus::Succeeded {
                    return None;
                }
                Some((id.to_string(), state.result.clone().unwrap_or_default()))
            })
            .collect()
    }

    fn status(&self, node: usize) -> NodeStatus {
        self.run
            .nodes
            .get(self.graph.id(node))
            .map_or(NodeStatus::Pending, |s| s.status)
    }

    fn state_mut(&mut self, node: usize) -> &mut NodeState {
        let id = self.graph.id(node);
        self.run
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| NodeState::pending(id))
    }
}

/// One attempt: input validation, then execution under the node timeout.
async fn run_attempt(
    agent: Result<Arc<dyn Agent>>,
    ctx: AgentContext,
    timeout: Duration,
) -> Result<Payload> {
    let agent = agent?;
    agent.validate_input(&ctx)?;

    let node = ctx.node_id.clone();
    match tokio::time::timeout(timeout, agent.execute(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(EntraflowError::Timeout {
            node,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
