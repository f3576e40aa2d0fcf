//! Mocks and fixtures shared by the EntraFlow test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use entraflow_core::error::{EntraflowError, Result};
use entraflow_core::payload::Payload;
use entraflow_core::traits::{Agent, StateStore};
use entraflow_core::types::{AgentContext, AgentHealth, RunId, RunSummary, WorkflowRun};
use entraflow_core::workflow::{NodeSpec, WorkflowDefinition};

/// Scriptable agent that records every invocation.
pub struct MockAgent {
    name: String,
    payload: serde_json::Value,
    fail_first: u32,
    always_fail: bool,
    reject_input: bool,
    delay: Option<Duration>,
    probe: Option<Arc<ConcurrencyProbe>>,
    calls: AtomicU32,
    validations: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
    seen: Mutex<Vec<AgentContext>>,
}

impl MockAgent {
    /// An agent that succeeds with an empty object.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            payload: serde_json::json!({}),
            fail_first: 0,
            always_fail: false,
            reject_input: false,
            delay: None,
            probe: None,
            calls: AtomicU32::new(0),
            validations: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// An agent that succeeds with `payload`.
    pub fn returning(name: &str, payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Self::new(name)
        }
    }

    /// Fail the first `n` executions, then succeed.
    pub fn failing_times(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Reject every context in `validate_input`.
    pub fn rejecting_input(mut self) -> Self {
        self.reject_input = true;
        self
    }

    /// Sleep (on the tokio clock) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of `execute` calls.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `validate_input` calls.
    pub fn validations(&self) -> u32 {
        self.validations.load(Ordering::SeqCst)
    }

    /// Tokio instants at which `execute` was entered.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Contexts passed to `execute`, in call order.
    pub fn contexts(&self) -> Vec<AgentContext> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Mock agent for tests"
    }

    fn validate_input(&self, _ctx: &AgentContext) -> Result<()> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.reject_input {
            return Err(EntraflowError::Validation(format!(
                "{} rejected its input",
                self.name
            )));
        }
        Ok(())
    }

    fn execute(&self, ctx: AgentContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Ok(mut times) = self.call_times.lock() {
                times.push(Instant::now());
            }
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(ctx);
            }

            let _guard = self.probe.as_ref().map(|p| p.enter());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.always_fail || call <= self.fail_first {
                return Err(EntraflowError::Execution {
                    agent: self.name.clone(),
                    message: format!("scripted failure on call {}", call),
                });
            }
            Ok(Payload::new(self.payload.clone()))
        })
    }

    fn status(&self) -> AgentHealth {
        AgentHealth {
            name: self.name.clone(),
            executions: self.calls() as u64,
            ..Default::default()
        }
    }
}

/// Tracks how many agents are executing at the same time.
#[derive(Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard { probe: self }
    }

    /// Highest number of simultaneous executions observed.
    pub fn max_observed(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A state store whose saves always fail. Loads find nothing.
#[derive(Default)]
pub struct FailingStore {
    attempts: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rejected saves.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl StateStore for FailingStore {
    fn save(&self, _run: &WorkflowRun) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(EntraflowError::Persistence("disk full".into()))
        })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<WorkflowRun>> {
        let run_id = run_id.to_string();
        Box::pin(async move { Err(EntraflowError::RunNotFound(run_id)) })
    }

    fn list_runs(&self) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move { Ok(Vec::new()) })
    }
}

/// A context for calling an agent directly.
pub fn test_context(node_id: &str, config: serde_json::Value) -> AgentContext {
    AgentContext {
        run_id: RunId::from_string("test-run"),
        node_id: node_id.to_string(),
        attempt: 1,
        config,
        upstream: HashMap::new(),
        inputs: HashMap::new(),
    }
}

pub mod fixtures {
    use super::*;

    /// `a -> b -> c`, every node on `agent`.
    pub fn linear(agent: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("linear")
            .node(NodeSpec::new("a", agent))
            .node(NodeSpec::new("b", agent).depends_on(&["a"]))
            .node(NodeSpec::new("c", agent).depends_on(&["b"]))
    }

    /// `a -> {b, c} -> d`, with the agent of each node given explicitly.
    pub fn diamond(a: &str, b: &str, c: &str, d: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("diamond")
            .node(NodeSpec::new("a", a))
            .node(NodeSpec::new("b", b).depends_on(&["a"]))
            .node(NodeSpec::new("c", c).depends_on(&["a"]))
            .node(NodeSpec::new("d", d).depends_on(&["b", "c"]))
    }

    /// A config file with one inline workflow on the built-in agents.
    pub const BRIEFING_CONFIG: &str = r#"
[engine]
max_parallelism = 2
default_timeout_secs = 30
default_max_retries = 2

[engine.backoff]
base_delay_ms = 10
max_delay_ms = 100

[[workflows]]
name = "briefing"
description = "Fetch weather and news, then report"

[[workflows.nodes]]
id = "weather"
agent = "constant"
config = { value = { temp = 21.5, sky = "clear" } }

[[workflows.nodes]]
id = "news"
agent = "constant"
config = { value = { sentiment = { score = -0.8 } } }

[[workflows.nodes]]
id = "report"
agent = "passthrough"
depends_on = ["weather", "news"]

[[workflows.nodes]]
id = "alert"
agent = "passthrough"
optional = true
config = { from = "news" }

[[workflows.edges]]
from = "news"
to = "alert"
condition = "sentiment.score < -0.5"
"#;
}
